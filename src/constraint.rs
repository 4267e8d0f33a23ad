// Copyright 2020 Joyent, Inc.

//! Constraint expressions.
//!
//! A constraint expression selects variables, structure fields and index
//! ranges out of a dataset:
//!
//! ```text
//! ce      := clause (';' clause)*
//! clause  := ['/'] tree ['|' filter]
//! tree    := segment ['.' tree | ['.'] '{' tree ((';' | ',') tree)* '}']
//! segment := name slice*
//! slice   := '[' ']' | '[' i ']' | '[' start ':' [last] ']'
//!          | '[' start ':' stride ':' [last] ']'
//! ```
//!
//! Index ranges are inclusive of `last`. `s.{a;b.c}` selects fields `a` and
//! `b.c` of `s`. A filter (see [`crate::filter`]) applies to the innermost
//! sequence on the clause's path outside any braces; filters on the same
//! sequence from several clauses must all hold.
//!
//! Compiling an expression against a dataset yields a [`ConstraintView`]:
//! a tree of [`Projection`]s keyed by each variable's declared position, so
//! walking it in key order is walking the dataset in declared order.

use std::collections::BTreeMap;
use std::fmt;

use crate::dmr::{Dataset, Dimension, Variable, VariableKind};
use crate::error::{DapError, Result};
use crate::filter::{Constant, Filter, Operand, Operator, Pattern, Predicate};

/// An inclusive `[start:stride:last]` selection over one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Slice {
    pub start: u64,
    pub stride: u64,
    pub last: u64,
}

impl Slice {
    pub fn new(start: u64, stride: u64, last: u64) -> Result<Slice> {
        if stride == 0 {
            return Err(DapError::bad_request("slice stride must be positive"));
        }
        if start > last {
            return Err(DapError::bad_request(format!(
                "slice start {} is past its last index {}",
                start, last
            )));
        }
        Ok(Slice {
            start,
            stride,
            last,
        })
    }

    /// Selects every index of a dimension of `size` elements.
    pub fn whole(size: u64) -> Result<Slice> {
        if size == 0 {
            return Err(DapError::bad_request("cannot select from a zero-length dimension"));
        }
        Slice::new(0, 1, size - 1)
    }

    pub fn count(&self) -> u64 {
        (self.last - self.start) / self.stride + 1
    }

    /// The dimension index of the `i`th selected element.
    pub fn index(&self, i: u64) -> u64 {
        self.start + i * self.stride
    }

    pub fn is_whole(&self, size: u64) -> bool {
        self.start == 0 && self.stride == 1 && self.last + 1 == size
    }

    fn check_within(&self, size: u64) -> Result<()> {
        if self.last >= size {
            return Err(DapError::bad_request(format!(
                "slice {} exceeds dimension size {}",
                self, size
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}:{}]", self.start, self.stride, self.last)
    }
}

/// Product of the slice extents; 1 for a scalar.
pub fn element_count(slices: &[Slice]) -> u64 {
    slices.iter().map(Slice::count).product()
}

/// The selected part of one variable: its slices (always one per
/// dimension), for structures and sequences the selected fields keyed by
/// declared field position, and for sequences an optional record filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    pub slices: Vec<Slice>,
    pub fields: BTreeMap<usize, Projection>,
    pub filter: Option<Filter>,
}

impl Projection {
    pub fn field(&self, index: usize) -> Option<&Projection> {
        self.fields.get(&index)
    }

    pub fn count(&self) -> u64 {
        element_count(&self.slices)
    }

    pub fn shape(&self) -> Vec<u64> {
        self.slices.iter().map(Slice::count).collect()
    }

    fn whole(var: &Variable) -> Result<Projection> {
        let mut fields = BTreeMap::new();
        for (i, field) in var.fields().iter().enumerate() {
            fields.insert(i, Projection::whole(field)?);
        }
        Ok(Projection {
            slices: whole_slices(var)?,
            fields,
            filter: None,
        })
    }
}

fn whole_slices(var: &Variable) -> Result<Vec<Slice>> {
    var.dims
        .iter()
        .map(|d| {
            Slice::whole(d.size).map_err(|_| {
                DapError::bad_request(format!(
                    "variable {} has a zero-length dimension",
                    var.name
                ))
            })
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintView {
    expression: String,
    variables: BTreeMap<usize, Projection>,
}

impl ConstraintView {
    /// Compiles `expression` against `dataset`. An empty expression selects
    /// the whole dataset.
    pub fn compile(expression: &str, dataset: &Dataset) -> Result<ConstraintView> {
        let clauses = Parser::new(expression).parse()?;
        if clauses.is_empty() {
            return ConstraintView::universal(dataset);
        }

        let mut roots: BTreeMap<usize, Node> = BTreeMap::new();
        for clause in clauses {
            let spine = clause.tree.spine();
            select(&mut roots, &dataset.variables, clause.tree)?;
            if let Some(filter) = clause.filter {
                attach_filter(&mut roots, dataset, &spine, filter)?;
            }
        }

        let mut variables = BTreeMap::new();
        for (index, node) in roots {
            let var = &dataset.variables[index];
            variables.insert(index, node.finish(var)?);
        }
        Ok(ConstraintView {
            expression: expression.to_string(),
            variables,
        })
    }

    pub fn universal(dataset: &Dataset) -> Result<ConstraintView> {
        let mut variables = BTreeMap::new();
        for (i, var) in dataset.variables.iter().enumerate() {
            variables.insert(i, Projection::whole(var)?);
        }
        Ok(ConstraintView {
            expression: String::new(),
            variables,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn projection(&self, index: usize) -> Option<&Projection> {
        self.variables.get(&index)
    }

    /// Selected top-level variables in declared order.
    pub fn variables(&self) -> impl Iterator<Item = (usize, &Projection)> {
        self.variables.iter().map(|(i, p)| (*i, p))
    }

    fn lookup(&self, path: &[usize]) -> Option<&Projection> {
        let (first, rest) = path.split_first()?;
        let mut proj = self.variables.get(first)?;
        for i in rest {
            proj = proj.fields.get(i)?;
        }
        Some(proj)
    }

    /// Whether the variable at `path` (declared positions from the top
    /// level down) is selected.
    pub fn includes(&self, path: &[usize]) -> bool {
        self.lookup(path).is_some()
    }

    pub fn slices(&self, path: &[usize]) -> Option<&[Slice]> {
        self.lookup(path).map(|p| p.slices.as_slice())
    }
}

fn find<'v>(siblings: &'v [Variable], name: &str) -> Result<(usize, &'v Variable)> {
    siblings
        .iter()
        .enumerate()
        .find(|(_, v)| v.name == name)
        .ok_or_else(|| DapError::bad_request(format!("no such variable or field: {}", name)))
}

/// Merges one parsed selection tree into `level`.
fn select(
    level: &mut BTreeMap<usize, Node>,
    siblings: &[Variable],
    tree: Tree,
) -> Result<()> {
    let (index, var) = find(siblings, &tree.name)?;
    if !tree.children.is_empty() && !var.is_compound() {
        return Err(DapError::bad_request(format!(
            "{} is not a structure or sequence",
            var.name
        )));
    }
    let node = level.entry(index).or_default();
    node.merge_slices(var, tree.slices)?;
    if tree.children.is_empty() {
        node.whole = true;
    }
    for child in tree.children {
        select(&mut node.children, var.fields(), child)?;
    }
    Ok(())
}

/// Binds `filter` to the innermost sequence named along `spine` and stores
/// it on that sequence's node.
fn attach_filter(
    roots: &mut BTreeMap<usize, Node>,
    dataset: &Dataset,
    spine: &[String],
    filter: Predicate<String>,
) -> Result<()> {
    let mut siblings = dataset.variables.as_slice();
    let mut path = Vec::with_capacity(spine.len());
    let mut target = None;
    for name in spine {
        let (index, var) = find(siblings, name)?;
        path.push(index);
        if let VariableKind::Sequence(_) = var.kind {
            target = Some((path.len(), var));
        }
        siblings = var.fields();
    }
    let (depth, sequence) = target.ok_or_else(|| {
        DapError::bad_request(format!(
            "filter on {} does not follow a sequence",
            spine.join(".")
        ))
    })?;
    let bound = filter.bind(sequence)?;

    let mut level = roots;
    for index in &path[..depth - 1] {
        level = &mut level
            .get_mut(index)
            .ok_or_else(|| DapError::internal("filtered path was not selected"))?
            .children;
    }
    let node = level
        .get_mut(&path[depth - 1])
        .ok_or_else(|| DapError::internal("filtered path was not selected"))?;
    node.filter = Some(match node.filter.take() {
        Some(existing) => Predicate::And(Box::new(existing), Box::new(bound)),
        None => bound,
    });
    Ok(())
}

#[derive(Default)]
struct Node {
    slices: Option<Vec<Slice>>,
    whole: bool,
    children: BTreeMap<usize, Node>,
    filter: Option<Filter>,
}

impl Node {
    fn merge_slices(&mut self, var: &Variable, slices: Vec<Slice>) -> Result<()> {
        if slices.is_empty() {
            return Ok(());
        }
        if slices.len() != var.dims.len() {
            return Err(DapError::bad_request(format!(
                "{} has rank {} but {} slices were given",
                var.name,
                var.dims.len(),
                slices.len()
            )));
        }
        let mut resolved = Vec::with_capacity(slices.len());
        for (slice, dim) in slices.iter().zip(var.dims.iter()) {
            resolved.push(resolve(*slice, dim)?);
        }
        match &self.slices {
            Some(existing) if *existing != resolved => {
                Err(DapError::bad_request(format!(
                    "conflicting slices for {}",
                    var.name
                )))
            }
            _ => {
                self.slices = Some(resolved);
                Ok(())
            }
        }
    }

    fn finish(self, var: &Variable) -> Result<Projection> {
        let slices = match self.slices {
            Some(slices) => slices,
            None => whole_slices(var)?,
        };
        let mut children = self.children;
        let mut fields = BTreeMap::new();
        for (i, field) in var.fields().iter().enumerate() {
            match children.remove(&i) {
                Some(child) => {
                    fields.insert(i, child.finish(field)?);
                }
                None if self.whole => {
                    fields.insert(i, Projection::whole(field)?);
                }
                None => (),
            }
        }
        Ok(Projection {
            slices,
            fields,
            filter: self.filter,
        })
    }
}

/// `Slice::last == u64::MAX` marks an open-ended `[start:]` range.
fn resolve(slice: Slice, dim: &Dimension) -> Result<Slice> {
    if dim.size == 0 {
        return Err(DapError::bad_request("cannot select from a zero-length dimension"));
    }
    let slice = if slice.last == u64::MAX {
        Slice::new(slice.start, slice.stride, dim.size - 1)?
    } else {
        slice
    };
    slice.check_within(dim.size)?;
    Ok(slice)
}

/// One parsed selection: a segment and, when it is followed by `.name` or a
/// braced group, the selections below it.
struct Tree {
    name: String,
    slices: Vec<Slice>,
    children: Vec<Tree>,
}

impl Tree {
    /// Names along the single path from this segment down to the first
    /// group or leaf.
    fn spine(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        let mut tree = self;
        while let [only] = tree.children.as_slice() {
            names.push(only.name.clone());
            tree = only;
        }
        names
    }
}

struct Clause {
    tree: Tree,
    filter: Option<Predicate<String>>,
}

struct Parser<'a> {
    text: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Parser<'a> {
        Parser {
            text,
            chars: text.char_indices().peekable(),
        }
    }

    fn error(&self, what: &str) -> DapError {
        DapError::bad_request(format!(
            "malformed constraint expression {:?}: {}",
            self.text, what
        ))
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn skip_ws(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.chars.next();
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        self.skip_ws();
        match self.chars.next() {
            Some((_, c)) if c == want => Ok(()),
            Some((_, c)) => Err(self.error(&format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(&format!("expected '{}'", want))),
        }
    }

    fn parse(mut self) -> Result<Vec<Clause>> {
        let mut clauses = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(';') => {
                    self.chars.next();
                    continue;
                }
                Some(_) => clauses.push(self.clause()?),
            }
            self.skip_ws();
            match self.chars.next() {
                None => break,
                Some((_, ';')) => (),
                Some((_, c)) => {
                    return Err(self.error(&format!("unexpected '{}'", c)))
                }
            }
        }
        Ok(clauses)
    }

    fn clause(&mut self) -> Result<Clause> {
        if self.peek() == Some('/') {
            self.chars.next();
        }
        let tree = self.tree()?;
        self.skip_ws();
        let filter = if self.peek() == Some('|') {
            self.chars.next();
            Some(self.filter()?)
        } else {
            None
        };
        Ok(Clause { tree, filter })
    }

    fn tree(&mut self) -> Result<Tree> {
        let (name, slices) = self.segment()?;
        self.skip_ws();
        let children = match self.peek() {
            Some('.') => {
                self.chars.next();
                self.skip_ws();
                if self.peek() == Some('{') {
                    self.group()?
                } else {
                    vec![self.tree()?]
                }
            }
            Some('{') => self.group()?,
            _ => Vec::new(),
        };
        Ok(Tree {
            name,
            slices,
            children,
        })
    }

    /// `{ tree ((';' | ',') tree)* }`
    fn group(&mut self) -> Result<Vec<Tree>> {
        self.expect('{')?;
        let mut trees = Vec::new();
        loop {
            trees.push(self.tree()?);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ';')) | Some((_, ',')) => (),
                Some((_, '}')) => break,
                Some((_, c)) => {
                    return Err(self.error(&format!("expected '}}', found '{}'", c)))
                }
                None => return Err(self.error("unclosed '{'")),
            }
        }
        Ok(trees)
    }

    fn segment(&mut self) -> Result<(String, Vec<Slice>)> {
        self.skip_ws();
        let name = self.name()?;
        let mut slices = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some('[') {
                break;
            }
            self.chars.next();
            if let Some(slice) = self.slice()? {
                slices.push(slice);
            } else if !slices.is_empty() {
                return Err(self.error("'[]' cannot be mixed with index ranges"));
            }
        }
        Ok((name, slices))
    }

    fn name(&mut self) -> Result<String> {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.chars.next();
                    match self.chars.next() {
                        Some((_, escaped)) => name.push(escaped),
                        None => return Err(self.error("dangling escape")),
                    }
                }
                '.' | '[' | ']' | ';' | ':' | '/' | '{' | '}' | '|' | ',' | '<'
                | '>' | '=' | '!' | '~' | '(' | ')' | '&' | '"' => break,
                c if c.is_whitespace() => break,
                c => {
                    name.push(c);
                    self.chars.next();
                }
            }
        }
        if name.is_empty() {
            return Err(self.error("expected a variable name"));
        }
        Ok(name)
    }

    fn number(&mut self) -> Result<Option<u64>> {
        self.skip_ws();
        let mut digits = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            digits.push(c);
            self.chars.next();
        }
        if digits.is_empty() {
            return Ok(None);
        }
        digits
            .parse()
            .map(Some)
            .map_err(|_| self.error(&format!("index {} is out of range", digits)))
    }

    /// Parses the inside of one bracket pair; `None` for `[]`.
    fn slice(&mut self) -> Result<Option<Slice>> {
        let first = self.number()?;
        self.skip_ws();
        if self.peek() == Some(']') {
            self.chars.next();
            return match first {
                None => Ok(None),
                Some(i) => Slice::new(i, 1, i).map(Some),
            };
        }
        let start = first.ok_or_else(|| self.error("expected an index"))?;
        self.expect(':')?;
        let second = self.number()?;
        self.skip_ws();
        let (stride, last) = if self.peek() == Some(':') {
            self.chars.next();
            let stride = second.ok_or_else(|| self.error("expected a stride"))?;
            (stride, self.number()?)
        } else {
            (1, second)
        };
        self.expect(']')?;
        Slice::new(start, stride, last.unwrap_or(u64::MAX)).map(Some)
    }

    fn filter(&mut self) -> Result<Predicate<String>> {
        let mut filter = self.term()?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.chars.next();
                }
                Some('&') => {
                    self.chars.next();
                    self.expect('&')?;
                }
                _ => break,
            }
            let next = self.term()?;
            filter = Predicate::And(Box::new(filter), Box::new(next));
        }
        Ok(filter)
    }

    fn term(&mut self) -> Result<Predicate<String>> {
        self.skip_ws();
        match self.peek() {
            Some('!') => {
                self.chars.next();
                Ok(Predicate::Not(Box::new(self.term()?)))
            }
            Some('(') => {
                self.chars.next();
                let inner = self.filter()?;
                self.expect(')')?;
                Ok(inner)
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Predicate<String>> {
        let left = self.operand()?;
        let op = self.operator()?;
        if op == Operator::Match {
            return match self.operand()? {
                Operand::Constant(Constant::Text(source)) => {
                    Ok(Predicate::Matches(left, Pattern::new(&source)?))
                }
                _ => Err(self.error("'~=' needs a quoted pattern")),
            };
        }
        let middle = self.operand()?;
        self.skip_ws();
        let ranged = op.is_relational() && matches!(self.peek(), Some('<') | Some('>'));
        if !ranged {
            return Ok(Predicate::Compare(left, op, middle));
        }
        let upper = self.operator()?;
        let right = self.operand()?;
        Ok(Predicate::And(
            Box::new(Predicate::Compare(left, op, middle.clone())),
            Box::new(Predicate::Compare(middle, upper, right)),
        ))
    }

    fn operator(&mut self) -> Result<Operator> {
        self.skip_ws();
        let first = self.chars.next().map(|(_, c)| c);
        let equals = self.peek() == Some('=');
        let op = match (first, equals) {
            (Some('<'), true) => Operator::Le,
            (Some('<'), false) => Operator::Lt,
            (Some('>'), true) => Operator::Ge,
            (Some('>'), false) => Operator::Gt,
            (Some('='), true) => Operator::Eq,
            (Some('!'), true) => Operator::Ne,
            (Some('~'), true) => Operator::Match,
            _ => return Err(self.error("expected a comparison operator")),
        };
        if equals {
            self.chars.next();
        }
        Ok(op)
    }

    fn operand(&mut self) -> Result<Operand<String>> {
        self.skip_ws();
        match self.peek() {
            Some('"') => self.text().map(|t| Operand::Constant(Constant::Text(t))),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                self.constant().map(Operand::Constant)
            }
            _ => self.name().map(Operand::Field),
        }
    }

    fn constant(&mut self) -> Result<Constant> {
        let mut literal = String::new();
        while let Some(c) = self.peek() {
            let exponent = literal.ends_with(|e: char| e == 'e' || e == 'E');
            let sign = (c == '-' || c == '+') && (literal.is_empty() || exponent);
            if !(c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || sign) {
                break;
            }
            literal.push(c);
            self.chars.next();
        }
        let float = literal.contains(|c: char| c == '.' || c == 'e' || c == 'E');
        let constant = if float {
            literal.parse().ok().map(Constant::Float)
        } else {
            literal.parse().ok().map(Constant::Integer)
        };
        constant.ok_or_else(|| self.error(&format!("bad number {}", literal)))
    }

    /// A double-quoted string; `\` escapes the next character.
    fn text(&mut self) -> Result<String> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(text),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, c)) => text.push(c),
                    None => return Err(self.error("dangling escape")),
                },
                Some((_, c)) => text.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }
}
