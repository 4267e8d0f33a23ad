// Copyright 2020 Joyent, Inc.

//! A provider serving datasets held entirely in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::Values;
use crate::constraint::Slice;
use crate::dmr::{Dataset, Variable, VariableKind};
use crate::dsp::{DataCursor, Dsp, DspProvider};
use crate::error::{DapError, Result};
use crate::odometer::{linear_offset, Odometer};

/// Values of one variable. Atomic data is the whole array in row-major
/// order; structures carry one record per instance; sequences carry the
/// list of records of each instance.
#[derive(Clone, Debug, PartialEq)]
pub enum MemoryData {
    Atomic(Values),
    Structure(Vec<MemoryRecord>),
    Sequence(Vec<Vec<MemoryRecord>>),
}

/// Field values of one structure instance or sequence record, in declared
/// field order.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRecord(pub Vec<MemoryData>);

struct MemoryDataset {
    dmr: Dataset,
    data: Vec<MemoryData>,
}

#[derive(Default)]
pub struct MemoryProvider {
    datasets: HashMap<String, Arc<MemoryDataset>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl MemoryProvider {
    pub fn new() -> MemoryProvider {
        MemoryProvider::default()
    }

    /// Serves `dmr` with `data` (one entry per top-level variable) at
    /// `path`. The data must agree with the metadata.
    pub fn insert(&mut self, path: &str, dmr: Dataset, data: Vec<MemoryData>) -> Result<()> {
        if data.len() != dmr.variables.len() {
            return Err(DapError::internal(format!(
                "{}: {} variables but data for {}",
                path,
                dmr.variables.len(),
                data.len()
            )));
        }
        for (var, values) in dmr.variables.iter().zip(data.iter()) {
            check(var, values)?;
        }
        self.datasets
            .insert(path.to_string(), Arc::new(MemoryDataset { dmr, data }));
        Ok(())
    }

    pub fn with_dataset(
        mut self,
        path: &str,
        dmr: Dataset,
        data: Vec<MemoryData>,
    ) -> Result<MemoryProvider> {
        self.insert(path, dmr, data)?;
        Ok(self)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl DspProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, path: &str) -> Result<Box<dyn Dsp>> {
        let dataset = self
            .datasets
            .get(path)
            .ok_or_else(|| DapError::NotFound(path.to_string()))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryDsp {
            location: path.to_string(),
            dataset: Arc::clone(dataset),
            closes: Arc::clone(&self.closes),
        }))
    }
}

fn element_count(var: &Variable) -> usize {
    var.shape().iter().product::<u64>() as usize
}

fn check(var: &Variable, data: &MemoryData) -> Result<()> {
    let mismatch = |what: &str| {
        DapError::internal(format!("data for {} does not match: {}", var.name, what))
    };
    let count = element_count(var);
    match (&var.kind, data) {
        (VariableKind::Atomic(ty), MemoryData::Atomic(values)) => {
            if !values.fits(ty.wire_type()) {
                return Err(mismatch("value type"));
            }
            if values.len() != count {
                return Err(mismatch("element count"));
            }
        }
        (VariableKind::Structure(fields), MemoryData::Structure(records)) => {
            if records.len() != count {
                return Err(mismatch("instance count"));
            }
            for record in records {
                check_record(fields, record).map_err(|e| mismatch(&e.to_string()))?;
            }
        }
        (VariableKind::Sequence(fields), MemoryData::Sequence(instances)) => {
            if instances.len() != count {
                return Err(mismatch("instance count"));
            }
            for record in instances.iter().flatten() {
                check_record(fields, record).map_err(|e| mismatch(&e.to_string()))?;
            }
        }
        _ => return Err(mismatch("variable kind")),
    }
    Ok(())
}

fn check_record(fields: &[Variable], record: &MemoryRecord) -> Result<()> {
    if fields.len() != record.0.len() {
        return Err(DapError::internal("field count"));
    }
    for (field, data) in fields.iter().zip(record.0.iter()) {
        check(field, data)?;
    }
    Ok(())
}

struct MemoryDsp {
    location: String,
    dataset: Arc<MemoryDataset>,
    closes: Arc<AtomicUsize>,
}

impl Dsp for MemoryDsp {
    fn location(&self) -> &str {
        &self.location
    }

    fn dmr(&self) -> &Dataset {
        &self.dataset.dmr
    }

    fn cursor(&self, index: usize) -> Result<Box<dyn DataCursor>> {
        if index >= self.dataset.data.len() {
            return Err(DapError::internal(format!(
                "{}: no variable at position {}",
                self.location, index
            )));
        }
        Ok(Box::new(MemoryCursor {
            dataset: Arc::clone(&self.dataset),
            var: index,
            steps: Vec::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum Step {
    Instance(usize),
    Field(usize),
    Record(usize),
}

/// A position in the data tree, kept as a path from a top-level variable
/// so cursors own nothing but a reference count.
#[derive(Clone)]
struct MemoryCursor {
    dataset: Arc<MemoryDataset>,
    var: usize,
    steps: Vec<Step>,
}

enum Node<'a> {
    Data(&'a MemoryData, &'a Variable),
    Record(&'a MemoryRecord, &'a Variable),
    Records(&'a [MemoryRecord], &'a Variable),
}

fn navigation_error() -> DapError {
    DapError::internal("cursor does not point at a matching data node")
}

impl MemoryCursor {
    fn resolve(&self) -> Result<Node<'_>> {
        let mut node = Node::Data(
            &self.dataset.data[self.var],
            &self.dataset.dmr.variables[self.var],
        );
        for step in &self.steps {
            node = match (node, *step) {
                (Node::Data(MemoryData::Structure(instances), var), Step::Instance(i)) => {
                    Node::Record(instances.get(i).ok_or_else(navigation_error)?, var)
                }
                (Node::Data(MemoryData::Sequence(instances), var), Step::Instance(i)) => {
                    Node::Records(instances.get(i).ok_or_else(navigation_error)?, var)
                }
                (Node::Record(record, var), Step::Field(f)) => Node::Data(
                    record.0.get(f).ok_or_else(navigation_error)?,
                    var.fields().get(f).ok_or_else(navigation_error)?,
                ),
                (Node::Records(records, var), Step::Record(r)) => {
                    Node::Record(records.get(r).ok_or_else(navigation_error)?, var)
                }
                _ => return Err(navigation_error()),
            };
        }
        Ok(node)
    }

    fn step(&self, steps: &[Step]) -> Box<dyn DataCursor> {
        let mut next = self.clone();
        next.steps.extend_from_slice(steps);
        Box::new(next)
    }

    /// The single instance of an undimensioned structure or sequence.
    fn scalar_instance(&self) -> Result<Option<MemoryCursor>> {
        match self.resolve()? {
            Node::Data(MemoryData::Structure(_), var)
            | Node::Data(MemoryData::Sequence(_), var)
                if var.rank() == 0 =>
            {
                let mut next = self.clone();
                next.steps.push(Step::Instance(0));
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }
}

impl DataCursor for MemoryCursor {
    fn read(&self, slices: &[Slice]) -> Result<Values> {
        match self.resolve()? {
            Node::Data(MemoryData::Atomic(values), var) => {
                if slices.len() != var.rank() {
                    return Err(DapError::internal(format!(
                        "{} has rank {} but was read with {} slices",
                        var.name,
                        var.rank(),
                        slices.len()
                    )));
                }
                let shape = var.shape();
                let offsets: Vec<usize> = Odometer::new(slices)
                    .map(|index| linear_offset(&index, &shape) as usize)
                    .collect();
                values.gather(&offsets)
            }
            _ => Err(navigation_error()),
        }
    }

    fn instance(&self, index: &[u64]) -> Result<Box<dyn DataCursor>> {
        match self.resolve()? {
            Node::Data(MemoryData::Structure(_), var)
            | Node::Data(MemoryData::Sequence(_), var) => {
                let offset = linear_offset(index, &var.shape()) as usize;
                Ok(self.step(&[Step::Instance(offset)]))
            }
            _ => Err(navigation_error()),
        }
    }

    fn field(&self, index: usize) -> Result<Box<dyn DataCursor>> {
        if let Some(instance) = self.scalar_instance()? {
            return instance.field(index);
        }
        match self.resolve()? {
            Node::Record(..) => Ok(self.step(&[Step::Field(index)])),
            _ => Err(navigation_error()),
        }
    }

    fn record_count(&self) -> Result<u64> {
        if let Some(instance) = self.scalar_instance()? {
            return instance.record_count();
        }
        match self.resolve()? {
            Node::Records(records, _) => Ok(records.len() as u64),
            _ => Err(navigation_error()),
        }
    }

    fn record(&self, index: u64) -> Result<Box<dyn DataCursor>> {
        if let Some(instance) = self.scalar_instance()? {
            return instance.record(index);
        }
        match self.resolve()? {
            Node::Records(..) => Ok(self.step(&[Step::Record(index as usize)])),
            _ => Err(navigation_error()),
        }
    }
}
