// Copyright 2020 Joyent, Inc.

//! Dataset metadata: the variable tree a data source exposes, and its
//! rendering as a (constrained) DMR document.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::codec::AtomicType;
use crate::constraint::{ConstraintView, Projection};
use crate::xml::escape;

pub const DAP_VERSION: &str = "4.0";
pub const DMR_VERSION: &str = "1.0";
const DAP_NAMESPACE: &str = "http://xml.opendap.org/ns/DAP/4.0#";
const INDENT: &str = "  ";

/// A dimension. Named dimensions are declared once at dataset level and
/// referenced by name; anonymous ones only carry a size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimension {
    pub name: Option<String>,
    pub size: u64,
}

impl Dimension {
    pub fn shared(name: &str, size: u64) -> Dimension {
        Dimension {
            name: Some(name.to_string()),
            size,
        }
    }

    pub fn anonymous(size: u64) -> Dimension {
        Dimension { name: None, size }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Enumeration {
    pub name: String,
    pub base: AtomicType,
    pub constants: Vec<(String, i64)>,
}

impl Enumeration {
    pub fn new(name: &str, base: AtomicType, constants: &[(&str, i64)]) -> Enumeration {
        Enumeration {
            name: name.to_string(),
            base,
            constants: constants
                .iter()
                .map(|(n, v)| (n.to_string(), *v))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DapType {
    Atomic(AtomicType),
    Enum { name: String, base: AtomicType },
}

impl DapType {
    /// The primitive type values are written as.
    pub fn wire_type(&self) -> AtomicType {
        match self {
            DapType::Atomic(t) => *t,
            DapType::Enum { base, .. } => *base,
        }
    }

    fn element_name(&self) -> &'static str {
        match self {
            DapType::Atomic(t) => t.name(),
            DapType::Enum { .. } => "Enum",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub ty: AtomicType,
    pub values: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VariableKind {
    Atomic(DapType),
    Structure(Vec<Variable>),
    Sequence(Vec<Variable>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub dims: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
}

impl Variable {
    fn with_kind(name: &str, kind: VariableKind) -> Variable {
        Variable {
            name: name.to_string(),
            kind,
            dims: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn atomic(name: &str, ty: AtomicType) -> Variable {
        Variable::with_kind(name, VariableKind::Atomic(DapType::Atomic(ty)))
    }

    pub fn enumerated(name: &str, enumeration: &Enumeration) -> Variable {
        Variable::with_kind(
            name,
            VariableKind::Atomic(DapType::Enum {
                name: enumeration.name.clone(),
                base: enumeration.base,
            }),
        )
    }

    pub fn structure(name: &str, fields: Vec<Variable>) -> Variable {
        Variable::with_kind(name, VariableKind::Structure(fields))
    }

    pub fn sequence(name: &str, fields: Vec<Variable>) -> Variable {
        Variable::with_kind(name, VariableKind::Sequence(fields))
    }

    pub fn with_dims(mut self, dims: Vec<Dimension>) -> Variable {
        self.dims = dims;
        self
    }

    pub fn with_attribute(mut self, name: &str, ty: AtomicType, values: &[&str]) -> Variable {
        self.attributes.push(Attribute {
            name: name.to_string(),
            ty,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn shape(&self) -> Vec<u64> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// Fields of a structure or sequence; empty for atomic variables.
    pub fn fields(&self) -> &[Variable] {
        match &self.kind {
            VariableKind::Structure(fields) | VariableKind::Sequence(fields) => fields.as_slice(),
            VariableKind::Atomic(_) => &[],
        }
    }

    pub fn is_compound(&self) -> bool {
        !matches!(self.kind, VariableKind::Atomic(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub enumerations: Vec<Enumeration>,
    pub variables: Vec<Variable>,
    pub attributes: Vec<Attribute>,
}

impl Dataset {
    pub fn new(name: &str) -> Dataset {
        Dataset {
            name: name.to_string(),
            dimensions: Vec::new(),
            enumerations: Vec::new(),
            variables: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_dimension(mut self, dim: Dimension) -> Dataset {
        self.dimensions.push(dim);
        self
    }

    pub fn with_enumeration(mut self, enumeration: Enumeration) -> Dataset {
        self.enumerations.push(enumeration);
        self
    }

    pub fn with_variable(mut self, var: Variable) -> Dataset {
        self.variables.push(var);
        self
    }

    pub fn with_attribute(mut self, name: &str, ty: AtomicType, values: &[&str]) -> Dataset {
        self.attributes.push(Attribute {
            name: name.to_string(),
            ty,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Renders the DMR for the parts of `dataset` selected by `view`.
/// Dimensions and enumerations are declared only when a selected variable
/// uses them; a dimension that is sliced is written as an anonymous
/// `<Dim size=..>` carrying the constrained extent.
pub fn render_dmr(dataset: &Dataset, view: &ConstraintView) -> String {
    let mut used = Usage::default();
    for (index, proj) in view.variables() {
        used.collect(&dataset.variables[index], proj);
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "<Dataset name=\"{}\" dapVersion=\"{}\" dmrVersion=\"{}\" xmlns=\"{}\" xmlns:dap=\"{}\">",
        escape(&dataset.name),
        DAP_VERSION,
        DMR_VERSION,
        DAP_NAMESPACE,
        DAP_NAMESPACE
    );
    for dim in &dataset.dimensions {
        if let Some(name) = dim.name.as_ref().filter(|n| used.dims.contains(*n)) {
            let _ = writeln!(
                out,
                "{}<Dimension name=\"{}\" size=\"{}\"/>",
                INDENT,
                escape(name),
                dim.size
            );
        }
    }
    for en in dataset
        .enumerations
        .iter()
        .filter(|e| used.enums.contains(&e.name))
    {
        let _ = writeln!(
            out,
            "{}<Enumeration name=\"{}\" basetype=\"{}\">",
            INDENT,
            escape(&en.name),
            en.base
        );
        for (name, value) in &en.constants {
            let _ = writeln!(
                out,
                "{}{}<EnumConst name=\"{}\" value=\"{}\"/>",
                INDENT,
                INDENT,
                escape(name),
                value
            );
        }
        let _ = writeln!(out, "{}</Enumeration>", INDENT);
    }
    for (index, proj) in view.variables() {
        render_variable(&mut out, &dataset.variables[index], proj, 1);
    }
    for attr in &dataset.attributes {
        render_attribute(&mut out, attr, 1);
    }
    out.push_str("</Dataset>");
    out
}

#[derive(Default)]
struct Usage {
    dims: BTreeSet<String>,
    enums: BTreeSet<String>,
}

impl Usage {
    fn collect(&mut self, var: &Variable, proj: &Projection) {
        for (dim, slice) in var.dims.iter().zip(proj.slices.iter()) {
            if let Some(name) = &dim.name {
                if slice.is_whole(dim.size) {
                    self.dims.insert(name.clone());
                }
            }
        }
        if let VariableKind::Atomic(DapType::Enum { name, .. }) = &var.kind {
            self.enums.insert(name.clone());
        }
        for (i, field_proj) in &proj.fields {
            self.collect(&var.fields()[*i], field_proj);
        }
    }
}

fn margin(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn render_variable(out: &mut String, var: &Variable, proj: &Projection, depth: usize) {
    let element = match &var.kind {
        VariableKind::Atomic(ty) => ty.element_name(),
        VariableKind::Structure(_) => "Structure",
        VariableKind::Sequence(_) => "Sequence",
    };
    margin(out, depth);
    let _ = write!(out, "<{} name=\"{}\"", element, escape(&var.name));
    if let VariableKind::Atomic(DapType::Enum { name, .. }) = &var.kind {
        let _ = write!(out, " enum=\"/{}\"", escape(name));
    }
    let has_body = var.is_compound() || !var.dims.is_empty() || !var.attributes.is_empty();
    if !has_body {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");
    for (i, field_proj) in &proj.fields {
        render_variable(out, &var.fields()[*i], field_proj, depth + 1);
    }
    for (dim, slice) in var.dims.iter().zip(proj.slices.iter()) {
        margin(out, depth + 1);
        match &dim.name {
            Some(name) if slice.is_whole(dim.size) => {
                let _ = writeln!(out, "<Dim name=\"/{}\"/>", escape(name));
            }
            _ => {
                let _ = writeln!(out, "<Dim size=\"{}\"/>", slice.count());
            }
        }
    }
    for attr in &var.attributes {
        render_attribute(out, attr, depth + 1);
    }
    margin(out, depth);
    let _ = writeln!(out, "</{}>", element);
}

fn render_attribute(out: &mut String, attr: &Attribute, depth: usize) {
    margin(out, depth);
    let _ = writeln!(
        out,
        "<Attribute name=\"{}\" type=\"{}\">",
        escape(&attr.name),
        attr.ty
    );
    for value in &attr.values {
        margin(out, depth + 1);
        let _ = writeln!(out, "<Value value=\"{}\"/>", escape(value));
    }
    margin(out, depth);
    out.push_str("</Attribute>\n");
}

#[cfg(test)]
mod test {
    use super::*;

    fn dataset() -> Dataset {
        let colors = Enumeration::new("colors", AtomicType::UInt8, &[("red", 1), ("blue", 2)]);
        Dataset::new("foo.nc")
            .with_dimension(Dimension::shared("t", 10))
            .with_dimension(Dimension::shared("unused", 2))
            .with_enumeration(colors.clone())
            .with_variable(
                Variable::atomic("x", AtomicType::Int32)
                    .with_dims(vec![Dimension::shared("t", 10)])
                    .with_attribute("units", AtomicType::String, &["m"]),
            )
            .with_variable(Variable::enumerated("c", &colors))
            .with_attribute("title", AtomicType::String, &["a <test>"])
    }

    #[test]
    fn whole_dataset() {
        let ds = dataset();
        let view = ConstraintView::universal(&ds).unwrap();
        let dmr = render_dmr(&ds, &view);
        assert!(dmr.starts_with("<Dataset name=\"foo.nc\" dapVersion=\"4.0\""));
        assert!(dmr.contains("<Dimension name=\"t\" size=\"10\"/>"));
        assert!(!dmr.contains("unused"));
        assert!(dmr.contains("<Enumeration name=\"colors\" basetype=\"UInt8\">"));
        assert!(dmr.contains("<EnumConst name=\"red\" value=\"1\"/>"));
        assert!(dmr.contains("<Dim name=\"/t\"/>"));
        assert!(dmr.contains("<Enum name=\"c\" enum=\"/colors\"/>"));
        assert!(dmr.contains("<Value value=\"a &lt;test&gt;\"/>"));
        assert!(dmr.ends_with("</Dataset>"));
    }

    #[test]
    fn constrained_dataset() {
        let ds = dataset();
        let view = ConstraintView::compile("x[0:1:5]", &ds).unwrap();
        let dmr = render_dmr(&ds, &view);
        assert!(dmr.contains("<Int32 name=\"x\">"));
        assert!(dmr.contains("<Dim size=\"6\"/>"));
        assert!(!dmr.contains("<Dimension "));
        assert!(!dmr.contains("colors"));
    }
}
