// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use dap4_encoder::codec::{AtomicType, Endian, Values};
use dap4_encoder::config::{ByteOrder, DapConfig};
use dap4_encoder::constraint::Slice;
use dap4_encoder::dispatcher::{Completion, MemoryResponse, RequestDispatcher};
use dap4_encoder::dmr::{Dataset, Dimension, Variable};
use dap4_encoder::dsp::memory::{MemoryData, MemoryProvider, MemoryRecord};
use dap4_encoder::dsp::{DataCursor, Dsp, DspProvider, DspRegistry, PathPattern};
use dap4_encoder::error::{DapError, ErrorKind, Result};
use dap4_encoder::protocol::{decode_stream, Chunk, XML_DOCUMENT_HEADER};
use dap4_encoder::request::{DATA_CONTENT_TYPE, ERROR_CONTENT_TYPE};

fn foo_dataset() -> (Dataset, Vec<MemoryData>) {
    let dmr = Dataset::new("foo.nc")
        .with_dimension(Dimension::shared("t", 10))
        .with_variable(
            Variable::atomic("x", AtomicType::Int32)
                .with_dims(vec![Dimension::shared("t", 10)]),
        )
        .with_variable(Variable::structure(
            "s",
            vec![
                Variable::atomic("a", AtomicType::Int16),
                Variable::atomic("b", AtomicType::String),
            ],
        ))
        .with_variable(Variable::sequence(
            "obs",
            vec![Variable::atomic("depth", AtomicType::Float64)],
        ));
    let depth = |v| MemoryRecord(vec![MemoryData::Atomic(Values::Float64(vec![v]))]);
    let data = vec![
        MemoryData::Atomic(Values::Int32((0..10).collect())),
        MemoryData::Structure(vec![MemoryRecord(vec![
            MemoryData::Atomic(Values::Int16(vec![-2])),
            MemoryData::Atomic(Values::String(vec!["hi".to_string()])),
        ])]),
        MemoryData::Sequence(vec![vec![depth(1.5), depth(2.5), depth(3.5)]]),
    ];
    (dmr, data)
}

fn provider() -> Arc<MemoryProvider> {
    let (dmr, data) = foo_dataset();
    Arc::new(
        MemoryProvider::new()
            .with_dataset("foo.nc", dmr, data)
            .unwrap(),
    )
}

fn dispatcher_with(provider: Arc<dyn DspProvider>, config: DapConfig) -> RequestDispatcher {
    let registry = DspRegistry::new().with(PathPattern::Suffix(".nc".into()), provider);
    RequestDispatcher::new(registry, config, None).unwrap()
}

fn big_endian() -> DapConfig {
    DapConfig {
        byte_order: ByteOrder::Big,
        ..DapConfig::default()
    }
}

fn get(dispatcher: &RequestDispatcher, target: &str) -> (Completion, MemoryResponse) {
    let mut response = MemoryResponse::new();
    let completion = dispatcher.handle_target(target, &mut response, &CancellationToken::new());
    (completion, response)
}

fn data_payload(chunks: &[Chunk]) -> Vec<u8> {
    chunks
        .iter()
        .filter(|c| !c.is_metadata() && !c.is_error())
        .flat_map(|c| c.payload.iter().cloned())
        .collect()
}

#[test]
fn constrained_data_scenario() {
    let provider = provider();
    let dispatcher = dispatcher_with(provider.clone(), DapConfig::default());
    let (completion, response) = get(&dispatcher, "/foo.nc.dap?dap4.ce=x[0:1:5]");
    assert!(completion.is_complete());
    assert_eq!(response.status, Some(200));
    assert_eq!(response.content_type.as_deref(), Some(DATA_CONTENT_TYPE));

    let chunks = decode_stream(&response.body).unwrap();
    let metadata = std::str::from_utf8(&chunks[0].payload).unwrap();
    assert!(chunks[0].is_metadata());
    assert!(metadata.starts_with(XML_DOCUMENT_HEADER));
    assert!(metadata.ends_with("</Dataset>\r\n"));
    assert!(metadata.contains("<Int32 name=\"x\">"));
    assert!(metadata.contains("<Dim size=\"6\"/>"));
    assert!(!metadata.contains("name=\"s\""));

    let last = chunks.last().unwrap();
    assert!(last.is_end() && !last.is_error());
    assert!(last.payload.is_empty());
    for chunk in &chunks[1..] {
        assert_eq!(chunk.endian(), Endian::native());
    }

    let payload = data_payload(&chunks);
    let expected: Vec<u8> = (0..6i32)
        .flat_map(|v| match Endian::native() {
            Endian::Big => v.to_be_bytes(),
            Endian::Little => v.to_le_bytes(),
        }.to_vec())
        .collect();
    assert_eq!(payload, expected);
    assert_eq!(provider.opens(), 1);
}

#[test]
fn whole_dataset_in_declared_order() {
    let dispatcher = dispatcher_with(provider(), big_endian());
    let (completion, response) = get(&dispatcher, "foo.nc.dap?dap4.ce=obs;s.b;s.a;x[9]");
    assert!(completion.is_complete());
    let chunks = decode_stream(&response.body).unwrap();
    let payload = data_payload(&chunks);

    let mut expected = vec![0, 0, 0, 9];
    expected.extend_from_slice(&(-2i16).to_be_bytes());
    expected.extend_from_slice(&2u64.to_be_bytes());
    expected.extend_from_slice(b"hi");
    expected.extend_from_slice(&3u64.to_be_bytes());
    for d in &[1.5f64, 2.5, 3.5] {
        expected.extend_from_slice(&d.to_be_bytes());
    }
    assert_eq!(payload, expected);
}

#[test]
fn metadata_only_response() {
    let dispatcher = dispatcher_with(provider(), DapConfig::default());
    let (completion, response) = get(&dispatcher, "foo.nc.dmr.xml?dap4.ce=s");
    assert!(completion.is_complete());
    let chunks = decode_stream(&response.body).unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].is_metadata());
    assert!(chunks[1].is_end());
    let metadata = std::str::from_utf8(&chunks[0].payload).unwrap();
    assert!(metadata.contains("<Structure name=\"s\">"));
    assert!(!metadata.contains("name=\"x\""));
}

#[test]
fn checksums_are_deterministic_and_detect_corruption() {
    let dispatcher = dispatcher_with(provider(), big_endian());
    let target = "foo.nc.dap?dap4.ce=x&dap4.checksum=true";
    let (_, first) = get(&dispatcher, target);
    let (_, second) = get(&dispatcher, target);
    assert_eq!(first.body, second.body);

    let payload = data_payload(&decode_stream(&first.body).unwrap());
    assert_eq!(payload.len(), 10 * 4 + 4);
    let (data, trailer) = payload.split_at(40);
    let crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    assert_eq!(crc, crc32fast::hash(data));

    let mut rng = rand::thread_rng();
    for _ in 0..32 {
        let mut corrupted = data.to_vec();
        let at = rng.gen_range(0, corrupted.len());
        let flip = rng.gen_range(1, 256) as u8;
        corrupted[at] ^= flip;
        assert_ne!(crc32fast::hash(&corrupted), crc);
    }
}

#[test]
fn little_endian_requests_set_the_flag() {
    let dispatcher = dispatcher_with(provider(), big_endian());
    let (_, response) = get(&dispatcher, "foo.nc.dap?dap4.ce=x[1]&dap4.byteorder=little");
    let chunks = decode_stream(&response.body).unwrap();
    assert_eq!(chunks[0].endian(), Endian::Big);
    assert_eq!(chunks[1].endian(), Endian::Little);
    assert_eq!(data_payload(&chunks), vec![1, 0, 0, 0]);
}

#[test]
fn capabilities_never_open_a_handle() {
    let provider = provider();
    let dispatcher = dispatcher_with(provider.clone(), DapConfig::default());
    let (completion, response) = get(&dispatcher, "foo.nc.dsr.xml");
    assert!(completion.is_complete());
    let body = String::from_utf8(response.body).unwrap();
    assert!(body.starts_with(XML_DOCUMENT_HEADER));
    assert!(body.contains("<DatasetServices"));
    assert!(body.contains("href=\"foo.nc.dap\""));
    assert_eq!(provider.opens(), 0);
    assert!(dispatcher.cache().is_empty());
}

#[test]
fn bad_paths_fail_before_the_cache() {
    let provider = provider();
    let dispatcher = dispatcher_with(provider.clone(), DapConfig::default());
    for (target, status) in &[
        ("foo.nc.das", 400),
        ("foo.nc", 400),
        ("foo.nc.dmr.xml.txt", 400),
        ("foo.nc.dap.html", 403),
        ("foo.nc.dmr.json", 403),
    ] {
        let (completion, response) = get(&dispatcher, target);
        assert_eq!(response.status, Some(*status), "{}", target);
        assert_eq!(response.content_type.as_deref(), Some(ERROR_CONTENT_TYPE));
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains(&format!("<Error httpcode=\"{}\">", status)));
        match completion {
            Completion::Reported(_) => (),
            other => panic!("{}: unexpected completion {:?}", target, other),
        }
    }
    assert_eq!(provider.opens(), 0);
}

#[test]
fn constraint_errors_reported_out_of_band() {
    let dispatcher = dispatcher_with(provider(), DapConfig::default());
    for ce in &["x[3:1]", "x[0:10]", "nosuch", "x[", "x.y"] {
        let (completion, response) = get(&dispatcher, &format!("foo.nc.dap?dap4.ce={}", ce));
        assert_eq!(completion.error().unwrap().kind(), ErrorKind::BadRequest, "{}", ce);
        assert_eq!(response.status, Some(400));
        assert!(decode_stream(&response.body).is_err());
    }
}

#[test]
fn unmatched_paths() {
    let dispatcher = dispatcher_with(provider(), DapConfig::default());
    let (completion, response) = get(&dispatcher, "foo.h5.dap");
    assert_eq!(
        completion.error().unwrap().kind(),
        ErrorKind::NoMatchingProvider
    );
    assert_eq!(response.status, Some(404));

    let (completion, _) = get(&dispatcher, "bar.nc.dap");
    assert_eq!(completion.error().unwrap().kind(), ErrorKind::NotFound);
}

#[test]
fn write_limit_before_commit_is_out_of_band() {
    let config = DapConfig {
        write_limit: Some(64),
        ..DapConfig::default()
    };
    let dispatcher = dispatcher_with(provider(), config);
    let (completion, response) = get(&dispatcher, "foo.nc.dap");
    assert_eq!(completion.error().unwrap().kind(), ErrorKind::PayloadTooLarge);
    assert_eq!(response.status, Some(413));
}

/// Serves `foo.nc` but fails to produce the second variable.
struct FailingProvider(Arc<MemoryProvider>);

struct FailingDsp(Box<dyn Dsp>);

impl DspProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn open(&self, path: &str) -> Result<Box<dyn Dsp>> {
        Ok(Box::new(FailingDsp(self.0.open(path)?)))
    }
}

impl Dsp for FailingDsp {
    fn location(&self) -> &str {
        self.0.location()
    }

    fn dmr(&self) -> &Dataset {
        self.0.dmr()
    }

    fn cursor(&self, index: usize) -> Result<Box<dyn DataCursor>> {
        if index == 1 {
            return Err(DapError::Internal("disk on fire".to_string()));
        }
        self.0.cursor(index)
    }
}

#[test]
fn error_after_data_ends_with_error_chunk() {
    let config = DapConfig {
        chunk_size: 8,
        ..big_endian()
    };
    let dispatcher = dispatcher_with(Arc::new(FailingProvider(provider())), config);
    let (completion, response) = get(&dispatcher, "foo.nc.dap");
    match &completion {
        Completion::Reported(e) => assert_eq!(e.kind(), ErrorKind::Internal),
        other => panic!("unexpected completion {:?}", other),
    }
    assert_eq!(response.status, Some(200));
    assert_eq!(response.content_type.as_deref(), Some(DATA_CONTENT_TYPE));

    let chunks = decode_stream(&response.body).unwrap();
    assert!(chunks[0].is_metadata());
    let last = chunks.last().unwrap();
    assert!(last.is_error() && last.is_end());
    let body = std::str::from_utf8(&last.payload).unwrap();
    assert!(body.contains("<Error httpcode=\"500\">"));
    assert!(body.contains("disk on fire"));
    assert_eq!(chunks.iter().filter(|c| c.is_end()).count(), 1);

    // only whole chunks of x made it out
    let sent = data_payload(&chunks);
    assert!(!sent.is_empty());
    assert_eq!(sent.len() % 8, 0);
    for chunk in &chunks[1..chunks.len() - 1] {
        assert!(chunk.payload.len() <= 8);
    }
}

#[test]
fn cancelled_requests_fail() {
    let dispatcher = dispatcher_with(provider(), DapConfig::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut response = MemoryResponse::new();
    let completion = dispatcher.handle_target("foo.nc.dap", &mut response, &cancel);
    assert_eq!(completion.error().unwrap().kind(), ErrorKind::Internal);
    assert_eq!(response.status, Some(500));
}

#[test]
fn slices_stay_inside_the_shape() {
    let (dmr, _) = foo_dataset();
    let view = dap4_encoder::constraint::ConstraintView::compile("x[2:3:9]", &dmr).unwrap();
    let slices = view.slices(&[0]).unwrap();
    assert_eq!(slices, &[Slice::new(2, 3, 9).unwrap()][..]);
    let picked: Vec<u64> = (0..slices[0].count()).map(|i| slices[0].index(i)).collect();
    assert_eq!(picked, vec![2, 5, 8]);
}

#[test]
fn filtered_sequence_over_query_string() {
    let dispatcher = dispatcher_with(provider(), big_endian());
    let (completion, response) =
        get(&dispatcher, "/foo.nc.dap?dap4.ce=s.{b;a};obs|depth>2%26%26depth<3.6");
    assert!(completion.is_complete());

    let chunks = decode_stream(&response.body).unwrap();
    let mut expected = vec![0xff, 0xfe, 0, 0, 0, 0, 0, 0, 0, 2, b'h', b'i'];
    expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2]);
    expected.extend_from_slice(&2.5f64.to_be_bytes());
    expected.extend_from_slice(&3.5f64.to_be_bytes());
    assert_eq!(data_payload(&chunks), expected);
}

#[test]
fn malformed_filter_is_reported_out_of_band() {
    let provider = provider();
    let dispatcher = dispatcher_with(provider.clone(), DapConfig::default());
    let (completion, response) = get(&dispatcher, "/foo.nc.dap?dap4.ce=obs|depth~=2");
    assert_eq!(completion.error().unwrap().kind(), ErrorKind::BadRequest);
    assert_eq!(response.status, Some(400));
    assert_eq!(response.content_type.as_deref(), Some(ERROR_CONTENT_TYPE));
}
