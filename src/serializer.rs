// Copyright 2020 Joyent, Inc.

//! Walks the constrained variable tree of a dataset and writes its values
//! through a [`SerialWriter`].
//!
//! Variables and fields are visited in declared order no matter how the
//! constraint expression listed them. Atomic arrays are read as one
//! contiguous row-major region; dimensioned structures and sequences are
//! walked instance by instance, last dimension fastest. Filtered sequences
//! are counted after filtering.

use std::io::Write;

use tokio_util::sync::CancellationToken;

use crate::constraint::{ConstraintView, Projection};
use crate::dmr::{DapType, Variable, VariableKind};
use crate::dsp::{DataCursor, Dsp};
use crate::error::{DapError, Result};
use crate::odometer::Odometer;
use crate::writer::SerialWriter;

/// Writes every variable selected by `view`. `cancel` is checked before
/// each top-level variable.
pub fn serialize<W: Write>(
    dsp: &dyn Dsp,
    view: &ConstraintView,
    writer: &mut SerialWriter<'_, W>,
    cancel: &CancellationToken,
) -> Result<()> {
    let dataset = dsp.dmr();
    for (index, projection) in view.variables() {
        if cancel.is_cancelled() {
            return Err(DapError::internal("request cancelled"));
        }
        let var = dataset.variables.get(index).ok_or_else(|| {
            DapError::internal(format!("constraint names variable {} of {}", index, dsp.location()))
        })?;
        let cursor = dsp.cursor(index)?;
        write_variable(var, projection, cursor.as_ref(), writer)?;
    }
    Ok(())
}

fn write_variable<W: Write>(
    var: &Variable,
    projection: &Projection,
    cursor: &dyn DataCursor,
    writer: &mut SerialWriter<'_, W>,
) -> Result<()> {
    writer.start_variable();
    match &var.kind {
        VariableKind::Atomic(ty) => write_atomic(var, ty, projection, cursor, writer)?,
        VariableKind::Structure(fields) => {
            if var.rank() == 0 {
                write_fields(fields, projection, cursor, writer)?;
            } else {
                for index in Odometer::new(&projection.slices) {
                    let instance = cursor.instance(&index)?;
                    write_fields(fields, projection, instance.as_ref(), writer)?;
                }
            }
        }
        VariableKind::Sequence(fields) => {
            if var.rank() == 0 {
                write_records(fields, projection, cursor, writer)?;
            } else {
                for index in Odometer::new(&projection.slices) {
                    let instance = cursor.instance(&index)?;
                    write_records(fields, projection, instance.as_ref(), writer)?;
                }
            }
        }
    }
    writer.end_variable()
}

fn write_atomic<W: Write>(
    var: &Variable,
    ty: &DapType,
    projection: &Projection,
    cursor: &dyn DataCursor,
    writer: &mut SerialWriter<'_, W>,
) -> Result<()> {
    let wire = ty.wire_type();
    let values = cursor.read(&projection.slices)?;
    let expected = projection.count();
    if values.len() as u64 != expected {
        return Err(DapError::internal(format!(
            "{}: read {} values, expected {}",
            var.name,
            values.len(),
            expected
        )));
    }
    if !values.fits(wire) {
        return Err(DapError::internal(format!(
            "{}: values do not match declared type {}",
            var.name, wire
        )));
    }
    writer.write_atomic_array(wire, &values)
}

/// Selected fields of one structure instance or sequence record.
fn write_fields<W: Write>(
    fields: &[Variable],
    projection: &Projection,
    cursor: &dyn DataCursor,
    writer: &mut SerialWriter<'_, W>,
) -> Result<()> {
    for (index, field_projection) in projection.fields.iter() {
        let field = fields.get(*index).ok_or_else(|| {
            DapError::internal(format!("constraint names missing field {}", index))
        })?;
        let field_cursor = cursor.field(*index)?;
        write_variable(field, field_projection, field_cursor.as_ref(), writer)?;
    }
    Ok(())
}

/// One sequence instance: its record count, then every record. With a
/// filter, only the passing records are counted and written.
fn write_records<W: Write>(
    fields: &[Variable],
    projection: &Projection,
    cursor: &dyn DataCursor,
    writer: &mut SerialWriter<'_, W>,
) -> Result<()> {
    let count = cursor.record_count()?;
    let filter = match &projection.filter {
        Some(filter) => filter,
        None => {
            writer.write_count(count)?;
            for r in 0..count {
                let record = cursor.record(r)?;
                write_fields(fields, projection, record.as_ref(), writer)?;
            }
            return Ok(());
        }
    };

    let mut selected = Vec::new();
    for r in 0..count {
        let record = cursor.record(r)?;
        if filter.matches(record.as_ref())? {
            selected.push(record);
        }
    }
    writer.write_count(selected.len() as u64)?;
    for record in selected {
        write_fields(fields, projection, record.as_ref(), writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::codec::{AtomicType, Endian, Values};
    use crate::constraint::Slice;
    use crate::dmr::{Dataset, Dimension, Enumeration};
    use crate::dsp::memory::{MemoryData, MemoryProvider, MemoryRecord};
    use crate::dsp::DspProvider;
    use crate::error::ErrorKind;
    use crate::framer::{ChunkFramer, FramerMode};
    use crate::protocol::decode_stream;

    fn sample() -> Box<dyn Dsp> {
        let dmr = Dataset::new("sample.nc")
            .with_variable(
                Variable::atomic("x", AtomicType::Int16)
                    .with_dims(vec![Dimension::anonymous(4)]),
            )
            .with_variable(Variable::structure(
                "s",
                vec![
                    Variable::atomic("a", AtomicType::UInt8),
                    Variable::atomic("b", AtomicType::UInt8),
                ],
            ))
            .with_variable(
                Variable::sequence("obs", vec![Variable::atomic("id", AtomicType::UInt8)])
                    .with_dims(vec![Dimension::anonymous(2)]),
            );
        let id = |v| MemoryRecord(vec![MemoryData::Atomic(Values::UInt8(vec![v]))]);
        let data = vec![
            MemoryData::Atomic(Values::Int16(vec![1, 2, 3, 4])),
            MemoryData::Structure(vec![MemoryRecord(vec![
                MemoryData::Atomic(Values::UInt8(vec![10])),
                MemoryData::Atomic(Values::UInt8(vec![20])),
            ])]),
            MemoryData::Sequence(vec![vec![id(7)], vec![id(8), id(9)]]),
        ];
        MemoryProvider::new()
            .with_dataset("sample.nc", dmr, data)
            .unwrap()
            .open("sample.nc")
            .unwrap()
    }

    /// `s[2]{a; inner{z[3]}; seq{r}}` and an `Int16`-based enum `e[2]`.
    fn nested() -> Box<dyn Dsp> {
        let q = Enumeration::new("q", AtomicType::Int16, &[("one", 1), ("many", 300)]);
        let dmr = Dataset::new("nested.nc")
            .with_enumeration(q.clone())
            .with_variable(
                Variable::structure(
                    "s",
                    vec![
                        Variable::atomic("a", AtomicType::UInt8),
                        Variable::structure(
                            "inner",
                            vec![Variable::atomic("z", AtomicType::Int16)
                                .with_dims(vec![Dimension::anonymous(3)])],
                        ),
                        Variable::sequence("seq", vec![Variable::atomic("r", AtomicType::UInt8)]),
                    ],
                )
                .with_dims(vec![Dimension::anonymous(2)]),
            )
            .with_variable(Variable::enumerated("e", &q).with_dims(vec![Dimension::anonymous(2)]));

        let instance = |a: u8, z: Vec<i16>, rs: Vec<u8>| {
            let records = rs
                .into_iter()
                .map(|r| MemoryRecord(vec![MemoryData::Atomic(Values::UInt8(vec![r]))]))
                .collect();
            MemoryRecord(vec![
                MemoryData::Atomic(Values::UInt8(vec![a])),
                MemoryData::Structure(vec![MemoryRecord(vec![MemoryData::Atomic(
                    Values::Int16(z),
                )])]),
                MemoryData::Sequence(vec![records]),
            ])
        };
        let data = vec![
            MemoryData::Structure(vec![
                instance(1, vec![10, 11, 12], vec![]),
                instance(2, vec![20, 21, 22], vec![7, 8]),
            ]),
            MemoryData::Atomic(Values::Enum(vec![1, 300])),
        ];
        MemoryProvider::new()
            .with_dataset("nested.nc", dmr, data)
            .unwrap()
            .open("nested.nc")
            .unwrap()
    }

    /// Bytes of the whole of `s` in `nested()`, big-endian.
    fn nested_s() -> Vec<u8> {
        let mut bytes = vec![1, 0, 10, 0, 11, 0, 12];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[2, 0, 20, 0, 21, 0, 22]);
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2, 7, 8]);
        bytes
    }

    fn run(dsp: &dyn Dsp, ce: &str, cancel: &CancellationToken) -> (Result<()>, Vec<u8>) {
        run_with(dsp, ce, cancel, false)
    }

    fn run_with(
        dsp: &dyn Dsp,
        ce: &str,
        cancel: &CancellationToken,
        checksum: bool,
    ) -> (Result<()>, Vec<u8>) {
        let view = ConstraintView::compile(ce, dsp.dmr()).unwrap();
        let mut framer =
            ChunkFramer::new(Vec::new(), FramerMode::Data, Endian::Big, 1024).unwrap();
        framer.write_metadata("<Dataset/>").unwrap();
        let result = {
            let mut writer = SerialWriter::new(&mut framer, checksum);
            serialize(dsp, &view, &mut writer, cancel)
        };
        if result.is_ok() {
            framer.close().unwrap();
        }
        let payload = decode_stream(framer.get_ref())
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| !c.is_metadata())
                    .flat_map(|c| c.payload.iter().cloned())
                    .collect()
            })
            .unwrap_or_default();
        (result, payload)
    }

    #[test]
    fn strided_array() {
        let dsp = sample();
        let (result, payload) = run(dsp.as_ref(), "x[1:2:3]", &CancellationToken::new());
        result.unwrap();
        assert_eq!(payload, vec![0, 2, 0, 4]);
    }

    #[test]
    fn fields_in_declared_order() {
        let dsp = sample();
        let (result, payload) = run(dsp.as_ref(), "s.b;s.a", &CancellationToken::new());
        result.unwrap();
        assert_eq!(payload, vec![10, 20]);
    }

    #[test]
    fn sequence_instances_carry_counts() {
        let dsp = sample();
        let (result, payload) = run(dsp.as_ref(), "obs", &CancellationToken::new());
        result.unwrap();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 1, 7];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2, 8, 9]);
        assert_eq!(payload, expected);
    }

    #[test]
    fn dimensioned_structure_instances() {
        let dsp = nested();
        let cancel = CancellationToken::new();
        let (result, payload) = run(dsp.as_ref(), "s[1].inner.z[0:2:2];s[1].a", &cancel);
        result.unwrap();
        assert_eq!(payload, vec![2, 0, 20, 0, 22]);

        let (result, payload) = run(dsp.as_ref(), "s", &cancel);
        result.unwrap();
        assert_eq!(payload, nested_s());
    }

    #[test]
    fn enums_at_base_width() {
        let dsp = nested();
        let (result, payload) = run(dsp.as_ref(), "e", &CancellationToken::new());
        result.unwrap();
        assert_eq!(payload, vec![0, 1, 1, 44]);
    }

    #[test]
    fn checksum_covers_every_instance() {
        let dsp = nested();
        let (result, payload) = run_with(dsp.as_ref(), "s;e", &CancellationToken::new(), true);
        result.unwrap();

        let s = nested_s();
        let e = vec![0, 1, 1, 44];
        let mut expected = s.clone();
        expected.extend_from_slice(&crc32fast::hash(&s).to_be_bytes());
        expected.extend_from_slice(&e);
        expected.extend_from_slice(&crc32fast::hash(&e).to_be_bytes());
        assert_eq!(payload, expected);
    }

    #[test]
    fn filters_count_passing_records() {
        let dsp = sample();
        let cancel = CancellationToken::new();
        let (result, payload) = run(dsp.as_ref(), "obs|id>7", &cancel);
        result.unwrap();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2, 8, 9]);
        assert_eq!(payload, expected);

        let (result, payload) = run(dsp.as_ref(), "obs|id==7", &cancel);
        result.unwrap();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 1, 7];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(payload, expected);
    }

    #[test]
    fn filter_on_nested_sequence() {
        let dsp = nested();
        let (result, payload) = run(dsp.as_ref(), "s.seq|r!=7", &CancellationToken::new());
        result.unwrap();
        let mut expected = vec![0, 0, 0, 0, 0, 0, 0, 0];
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1, 8]);
        assert_eq!(payload, expected);
    }

    #[test]
    fn cancelled_before_first_variable() {
        let dsp = sample();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (result, payload) = run(dsp.as_ref(), "", &cancel);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
        assert!(payload.is_empty());
    }

    struct ShortRead;

    impl DataCursor for ShortRead {
        fn read(&self, _slices: &[Slice]) -> Result<Values> {
            Ok(Values::Int16(vec![1]))
        }

        fn instance(&self, _index: &[u64]) -> Result<Box<dyn DataCursor>> {
            Err(DapError::internal("not a compound"))
        }

        fn field(&self, _index: usize) -> Result<Box<dyn DataCursor>> {
            Err(DapError::internal("not a compound"))
        }

        fn record_count(&self) -> Result<u64> {
            Err(DapError::internal("not a sequence"))
        }

        fn record(&self, _index: u64) -> Result<Box<dyn DataCursor>> {
            Err(DapError::internal("not a sequence"))
        }
    }

    struct ShortDsp(Dataset);

    impl Dsp for ShortDsp {
        fn location(&self) -> &str {
            "short.nc"
        }

        fn dmr(&self) -> &Dataset {
            &self.0
        }

        fn cursor(&self, _index: usize) -> Result<Box<dyn DataCursor>> {
            Ok(Box::new(ShortRead))
        }
    }

    #[test]
    fn short_reads_are_internal_errors() {
        let dsp = ShortDsp(Dataset::new("short.nc").with_variable(
            Variable::atomic("x", AtomicType::Int16).with_dims(vec![Dimension::anonymous(3)]),
        ));
        let (result, _) = run(&dsp, "", &CancellationToken::new());
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Internal);
    }
}
