// Copyright 2020 Joyent, Inc.

//! Data source providers.
//!
//! A [`Dsp`] is one opened dataset: it exposes the metadata tree and hands
//! out [`DataCursor`]s that materialize values. Providers that know how to
//! open a family of resource paths are registered, in order, in a
//! [`DspRegistry`]; the first whose [`PathPattern`] matches a path opens it.

use std::sync::Arc;

use crate::codec::Values;
use crate::constraint::Slice;
use crate::dmr::Dataset;
use crate::error::{DapError, Result};

pub mod memory;

/// Read access to the data of one variable, structure instance, sequence
/// instance or sequence record. Methods that make no sense for the node a
/// cursor points at return an error.
pub trait DataCursor {
    /// Reads the constrained region of an atomic variable as one row-major
    /// vector. Scalars take no slices.
    fn read(&self, slices: &[Slice]) -> Result<Values>;

    /// Cursor over one instance of a dimensioned structure or sequence.
    fn instance(&self, index: &[u64]) -> Result<Box<dyn DataCursor>>;

    /// Cursor over field `index` of a structure instance or sequence record.
    fn field(&self, index: usize) -> Result<Box<dyn DataCursor>>;

    /// Number of records in a sequence instance.
    fn record_count(&self) -> Result<u64>;

    fn record(&self, index: u64) -> Result<Box<dyn DataCursor>>;
}

pub trait Dsp: Send + Sync {
    fn location(&self) -> &str;

    fn dmr(&self) -> &Dataset;

    /// Cursor over top-level variable `index` of [`Dsp::dmr`].
    fn cursor(&self, index: usize) -> Result<Box<dyn DataCursor>>;

    /// Releases format-specific resources. Called once, when the handle is
    /// dropped by its last owner.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub trait DspProvider: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, path: &str) -> Result<Box<dyn Dsp>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathPattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
}

impl PathPattern {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Any => true,
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(p) => path.starts_with(p.as_str()),
            PathPattern::Suffix(p) => path.ends_with(p.as_str()),
        }
    }
}

#[derive(Default, Clone)]
pub struct DspRegistry {
    entries: Vec<(PathPattern, Arc<dyn DspProvider>)>,
}

impl DspRegistry {
    pub fn new() -> DspRegistry {
        DspRegistry::default()
    }

    /// Adds a provider after every one registered so far.
    pub fn register(&mut self, pattern: PathPattern, provider: Arc<dyn DspProvider>) {
        self.entries.push((pattern, provider));
    }

    pub fn with(mut self, pattern: PathPattern, provider: Arc<dyn DspProvider>) -> DspRegistry {
        self.register(pattern, provider);
        self
    }

    pub fn resolve(&self, path: &str) -> Option<&Arc<dyn DspProvider>> {
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(path))
            .map(|(_, provider)| provider)
    }

    pub fn open(&self, path: &str) -> Result<Box<dyn Dsp>> {
        match self.resolve(path) {
            Some(provider) => provider.open(path),
            None => Err(DapError::NoMatchingProvider(path.to_string())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::dsp::memory::MemoryProvider;
    use crate::error::ErrorKind;

    #[test]
    fn patterns() {
        assert!(PathPattern::Suffix(".nc".into()).matches("a/b.nc"));
        assert!(!PathPattern::Suffix(".nc".into()).matches("a/b.h5"));
        assert!(PathPattern::Prefix("synth/".into()).matches("synth/x"));
        assert!(PathPattern::Exact("x".into()).matches("x"));
        assert!(PathPattern::Any.matches(""));
    }

    #[test]
    fn first_match_wins() {
        let first = Arc::new(
            MemoryProvider::new()
                .with_dataset("a.nc", Dataset::new("a.nc"), vec![])
                .unwrap(),
        );
        let second = Arc::new(MemoryProvider::new());
        let registry = DspRegistry::new()
            .with(PathPattern::Suffix(".nc".into()), first.clone())
            .with(PathPattern::Any, second.clone());

        assert!(registry.open("a.nc").is_ok());
        assert_eq!(first.opens(), 1);
        let err = registry.open("b.h5").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(second.opens(), 0);
    }

    #[test]
    fn no_provider() {
        let registry = DspRegistry::new();
        let err = registry.open("a.nc").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoMatchingProvider);
    }
}
