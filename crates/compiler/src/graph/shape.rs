// Tensor shapes and symbolic dimensions
//
// A dimension is either a fixed integer or a reference into the graph's
// SymbolTable. The table interns symbolic expressions so that the same
// arithmetic over the same inputs always yields the same symbol, and keeps a
// union-find over symbols that were proven equal during shape binding.

use rustc_hash::FxHashMap;
use std::fmt;

/// Identifier of an interned symbolic dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A single tensor dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(i64),
    Symbolic(SymbolId),
}

impl Dim {
    pub fn fixed(self) -> Option<i64> {
        match self {
            Dim::Fixed(v) => Some(v),
            Dim::Symbolic(_) => None,
        }
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, Dim::Fixed(_))
    }
}

impl From<i64> for Dim {
    fn from(value: i64) -> Self {
        Dim::Fixed(value)
    }
}

/// Ordered list of dimensions
pub type Shape = Vec<Dim>;

/// Build a fully fixed shape
pub fn fixed_shape(dims: &[i64]) -> Shape {
    dims.iter().map(|&d| Dim::Fixed(d)).collect()
}

/// Concrete dims if every dimension is fixed
pub fn concrete_dims(shape: &[Dim]) -> Option<Vec<i64>> {
    shape.iter().map(|d| d.fixed()).collect()
}

/// Symbolic expression behind a SymbolId
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymExpr {
    /// Named model axis (`batch`, `height`, `width`, or an imported `dim_param`)
    Axis(String),
    /// `floor((num * base + offset) / den)`
    Affine {
        base: SymbolId,
        num: i64,
        offset: i64,
        den: i64,
    },
    /// `coeff * f0 * f1 * ...` with sorted factors
    Product { factors: Vec<SymbolId>, coeff: i64 },
    /// `constant + t0 + t1 + ...` with sorted terms
    Sum { terms: Vec<SymbolId>, constant: i64 },
    /// Count only known at runtime (e.g. surviving NMS candidates)
    DataDependent { label: String, upper_bound: Option<i64> },
    /// Dimension with no known relation to the inputs
    Opaque { label: String },
}

/// Where a symbol comes from; decides what serialization allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolOrigin {
    /// A caller-facing axis of a graph input
    Input,
    /// Arithmetic over input axes
    Derived,
    /// Depends on tensor contents rather than input shapes
    DataDependent,
}

/// Interning table for symbolic dimensions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    exprs: Vec<SymExpr>,
    origins: Vec<SymbolOrigin>,
    parent: Vec<SymbolId>,
    interned: FxHashMap<SymExpr, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    fn push(&mut self, expr: SymExpr, origin: SymbolOrigin) -> SymbolId {
        let id = SymbolId(self.exprs.len() as u32);
        self.exprs.push(expr);
        self.origins.push(origin);
        self.parent.push(id);
        id
    }

    fn intern(&mut self, expr: SymExpr) -> SymbolId {
        if let Some(&id) = self.interned.get(&expr) {
            return id;
        }
        let origin = self.origin_of_expr(&expr);
        let id = self.push(expr.clone(), origin);
        self.interned.insert(expr, id);
        id
    }

    fn origin_of_expr(&self, expr: &SymExpr) -> SymbolOrigin {
        let children: Vec<SymbolId> = match expr {
            SymExpr::Axis(_) => return SymbolOrigin::Input,
            SymExpr::DataDependent { .. } => return SymbolOrigin::DataDependent,
            SymExpr::Opaque { .. } => return SymbolOrigin::Derived,
            SymExpr::Affine { base, .. } => vec![*base],
            SymExpr::Product { factors, .. } => factors.clone(),
            SymExpr::Sum { terms, .. } => terms.clone(),
        };
        if children.iter().any(|&c| self.origin(c) == SymbolOrigin::DataDependent) {
            SymbolOrigin::DataDependent
        } else {
            SymbolOrigin::Derived
        }
    }

    /// Expression behind a symbol (after resolving unification)
    pub fn expr(&self, id: SymbolId) -> &SymExpr {
        &self.exprs[self.find(id).index()]
    }

    pub fn origin(&self, id: SymbolId) -> SymbolOrigin {
        self.origins[self.find(id).index()]
    }

    /// Representative of the equivalence class containing `id`
    pub fn find(&self, id: SymbolId) -> SymbolId {
        let mut current = id;
        while self.parent[current.index()] != current {
            current = self.parent[current.index()];
        }
        current
    }

    /// Canonical form of a dimension
    pub fn resolve(&self, dim: Dim) -> Dim {
        match dim {
            Dim::Fixed(_) => dim,
            Dim::Symbolic(id) => Dim::Symbolic(self.find(id)),
        }
    }

    pub fn resolve_shape(&self, shape: &[Dim]) -> Shape {
        shape.iter().map(|&d| self.resolve(d)).collect()
    }

    /// Named model axis; the same name always yields the same symbol
    pub fn axis(&mut self, name: &str) -> SymbolId {
        self.intern(SymExpr::Axis(name.to_string()))
    }

    /// Look up an axis symbol without creating it
    pub fn find_axis(&self, name: &str) -> Option<SymbolId> {
        self.interned.get(&SymExpr::Axis(name.to_string())).copied()
    }

    /// Fresh data-dependent symbol
    pub fn data_dependent(&mut self, label: &str, upper_bound: Option<i64>) -> Dim {
        let label = format!("{}_{}", label, self.exprs.len());
        Dim::Symbolic(self.push(
            SymExpr::DataDependent { label, upper_bound },
            SymbolOrigin::DataDependent,
        ))
    }

    /// Fresh symbol with no relation to any other dimension
    pub fn opaque(&mut self, label: &str) -> Dim {
        let label = format!("{}_{}", label, self.exprs.len());
        Dim::Symbolic(self.push(SymExpr::Opaque { label }, SymbolOrigin::Derived))
    }

    /// `floor((num * dim + offset) / den)`
    pub fn affine(&mut self, dim: Dim, num: i64, offset: i64, den: i64) -> Dim {
        debug_assert!(den > 0);
        let id = match self.resolve(dim) {
            Dim::Fixed(v) => return Dim::Fixed((num * v + offset).div_euclid(den)),
            Dim::Symbolic(id) => id,
        };
        let (mut base, mut num, mut offset, den) = (id, num, offset, den);
        if let SymExpr::Affine {
            base: inner,
            num: n2,
            offset: o2,
            den: 1,
        } = self.expr(base).clone()
        {
            // num * (n2 * x + o2) + offset
            base = self.find(inner);
            offset += num * o2;
            num *= n2;
        }
        if num == 0 {
            return Dim::Fixed(offset.div_euclid(den));
        }
        let g = gcd(gcd(num, offset), den);
        let (num, offset, den) = (num / g, offset / g, den / g);
        if num == 1 && offset == 0 && den == 1 {
            return Dim::Symbolic(base);
        }
        Dim::Symbolic(self.intern(SymExpr::Affine {
            base,
            num,
            offset,
            den,
        }))
    }

    /// `dim + offset`
    pub fn offset(&mut self, dim: Dim, offset: i64) -> Dim {
        self.affine(dim, 1, offset, 1)
    }

    fn flatten_product(&self, dims: &[Dim]) -> (Vec<SymbolId>, i64) {
        let mut factors = Vec::new();
        let mut coeff = 1i64;
        for &dim in dims {
            match self.resolve(dim) {
                Dim::Fixed(v) => coeff *= v,
                Dim::Symbolic(id) => match self.expr(id) {
                    SymExpr::Product { factors: inner, coeff: c } => {
                        factors.extend(inner.iter().map(|&f| self.find(f)));
                        coeff *= c;
                    }
                    _ => factors.push(id),
                },
            }
        }
        factors.sort();
        (factors, coeff)
    }

    fn make_product(&mut self, mut factors: Vec<SymbolId>, coeff: i64) -> Dim {
        if coeff == 0 {
            return Dim::Fixed(0);
        }
        factors.sort();
        match factors.len() {
            0 => Dim::Fixed(coeff),
            1 if coeff == 1 => Dim::Symbolic(factors[0]),
            _ => Dim::Symbolic(self.intern(SymExpr::Product { factors, coeff })),
        }
    }

    /// Product of dimensions
    pub fn mul(&mut self, dims: &[Dim]) -> Dim {
        let (factors, coeff) = self.flatten_product(dims);
        self.make_product(factors, coeff)
    }

    /// Exact quotient `product(total) / product(known)` by factor cancellation
    ///
    /// Returns `None` when a known factor does not occur in `total` or the
    /// constant parts do not divide.
    pub fn div_exact(&mut self, total: &[Dim], known: &[Dim]) -> Option<Dim> {
        let (mut factors, coeff) = self.flatten_product(total);
        let (known_factors, known_coeff) = self.flatten_product(known);
        for k in known_factors {
            let pos = factors.iter().position(|&f| f == k)?;
            factors.remove(pos);
        }
        if known_coeff == 0 || coeff % known_coeff != 0 {
            return None;
        }
        Some(self.make_product(factors, coeff / known_coeff))
    }

    /// Sum of dimensions
    pub fn add(&mut self, dims: &[Dim]) -> Dim {
        let mut terms = Vec::new();
        let mut constant = 0i64;
        for &dim in dims {
            match self.resolve(dim) {
                Dim::Fixed(v) => constant += v,
                Dim::Symbolic(id) => match self.expr(id).clone() {
                    SymExpr::Sum { terms: inner, constant: c } => {
                        terms.extend(inner.iter().map(|&t| self.find(t)));
                        constant += c;
                    }
                    _ => terms.push(id),
                },
            }
        }
        terms.sort();
        match terms.len() {
            0 => Dim::Fixed(constant),
            1 if constant == 0 => Dim::Symbolic(terms[0]),
            _ => Dim::Symbolic(self.intern(SymExpr::Sum { terms, constant })),
        }
    }

    /// Record that two dimensions are equal
    ///
    /// Fixed dims must match exactly. A fixed dim absorbs a symbolic one;
    /// two symbols are merged, preferring input axes as representative.
    pub fn unify(&mut self, a: Dim, b: Dim) -> std::result::Result<Dim, String> {
        match (self.resolve(a), self.resolve(b)) {
            (Dim::Fixed(x), Dim::Fixed(y)) if x == y => Ok(Dim::Fixed(x)),
            (Dim::Fixed(x), Dim::Fixed(y)) => Err(format!("{} != {}", x, y)),
            (Dim::Fixed(x), Dim::Symbolic(_)) | (Dim::Symbolic(_), Dim::Fixed(x)) => Ok(Dim::Fixed(x)),
            (Dim::Symbolic(x), Dim::Symbolic(y)) if x == y => Ok(Dim::Symbolic(x)),
            (Dim::Symbolic(x), Dim::Symbolic(y)) => {
                let rank = |t: &Self, s: SymbolId| match t.origins[s.index()] {
                    SymbolOrigin::Input => 0,
                    SymbolOrigin::Derived => 1,
                    SymbolOrigin::DataDependent => 2,
                };
                let (keep, merge) = if (rank(self, x), x) <= (rank(self, y), y) {
                    (x, y)
                } else {
                    (y, x)
                };
                self.parent[merge.index()] = keep;
                Ok(Dim::Symbolic(keep))
            }
        }
    }

    /// Smallest value the dimension can take
    pub fn lower_bound(&self, dim: Dim) -> i64 {
        match self.resolve(dim) {
            Dim::Fixed(v) => v,
            Dim::Symbolic(id) => match self.expr(id) {
                SymExpr::Axis(_) => 1,
                SymExpr::Affine {
                    base,
                    num,
                    offset,
                    den,
                } if *num > 0 => {
                    let lb = self.lower_bound(Dim::Symbolic(*base));
                    (num * lb + offset).div_euclid(*den).max(0)
                }
                SymExpr::Affine { .. } => 0,
                SymExpr::Product { factors, coeff } if *coeff > 0 => factors
                    .iter()
                    .map(|&f| self.lower_bound(Dim::Symbolic(f)))
                    .product::<i64>()
                    .saturating_mul(*coeff),
                SymExpr::Product { .. } => 0,
                SymExpr::Sum { terms, constant } => {
                    terms.iter().map(|&t| self.lower_bound(Dim::Symbolic(t))).sum::<i64>() + constant
                }
                SymExpr::DataDependent { .. } | SymExpr::Opaque { .. } => 0,
            },
        }
    }

    /// Largest value the dimension can take, if bounded
    pub fn upper_bound(&self, dim: Dim) -> Option<i64> {
        match self.resolve(dim) {
            Dim::Fixed(v) => Some(v),
            Dim::Symbolic(id) => match self.expr(id) {
                SymExpr::DataDependent { upper_bound, .. } => *upper_bound,
                SymExpr::Sum { terms, constant } => {
                    let mut total = *constant;
                    for &t in terms {
                        total = total.checked_add(self.upper_bound(Dim::Symbolic(t))?)?;
                    }
                    Some(total)
                }
                SymExpr::Product { factors, coeff } if *coeff > 0 => {
                    let mut total = *coeff;
                    for &f in factors {
                        total = total.checked_mul(self.upper_bound(Dim::Symbolic(f))?)?;
                    }
                    Some(total)
                }
                _ => None,
            },
        }
    }

    /// Human-readable name used as ONNX `dim_param`
    pub fn render(&self, id: SymbolId) -> String {
        let render_child = |s: &SymbolId| {
            let text = self.render(*s);
            if matches!(self.expr(*s), SymExpr::Sum { .. } | SymExpr::Affine { .. }) {
                format!("({})", text)
            } else {
                text
            }
        };
        match self.expr(id) {
            SymExpr::Axis(name) => name.clone(),
            SymExpr::DataDependent { label, .. } | SymExpr::Opaque { label } => label.clone(),
            SymExpr::Affine {
                base,
                num,
                offset,
                den,
            } => {
                let mut text = if *num == 1 {
                    render_child(base)
                } else {
                    format!("{}*{}", num, render_child(base))
                };
                if *offset > 0 {
                    text = format!("{} + {}", text, offset);
                } else if *offset < 0 {
                    text = format!("{} - {}", text, -offset);
                }
                if *den == 1 {
                    text
                } else {
                    format!("floor(({})/{})", text, den)
                }
            }
            SymExpr::Product { factors, coeff } => {
                let mut parts: Vec<String> = Vec::new();
                if *coeff != 1 {
                    parts.push(coeff.to_string());
                }
                parts.extend(factors.iter().map(render_child));
                parts.join("*")
            }
            SymExpr::Sum { terms, constant } => {
                let mut parts: Vec<String> = terms.iter().map(|t| self.render(*t)).collect();
                if *constant != 0 {
                    parts.push(constant.to_string());
                }
                parts.join(" + ")
            }
        }
    }

    /// Render a dimension (fixed values print as integers)
    pub fn render_dim(&self, dim: Dim) -> String {
        match self.resolve(dim) {
            Dim::Fixed(v) => v.to_string(),
            Dim::Symbolic(id) => self.render(id),
        }
    }

    pub fn render_shape(&self, shape: &[Dim]) -> String {
        let dims: Vec<String> = shape.iter().map(|&d| self.render_dim(d)).collect();
        format!("[{}]", dims.join(", "))
    }
}

fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{}", v),
            Dim::Symbolic(id) => write!(f, "s{}", id.0),
        }
    }
}
