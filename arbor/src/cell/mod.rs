// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The uniformly tagged runtime value.
//!
//! A [`Cell`] is a cheap handle over a reference-counted header: cloning a
//! handle is a retain, dropping one is a release, and the weak count keeps
//! the header observable after the strong count hits zero so weak references
//! can report "target gone". Alongside its payload every value carries
//! linear-type flags ([`Linear`]), capability flags ([`Caps`]) checked at
//! runtime boundaries, and a mark bit reserved for debugging tooling.
//!
//! Equality is structural by variant - deep on pairs, structures, and
//! graphs, reference identity on opaque variants (lambdas, builtins, boxes,
//! maps). Long pair chains are released iteratively so dropping a
//! million-element list cannot exhaust the native stack.

mod map;

pub use map::CellMap;

use crate::eval::EvalCtx;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Actor handles are integer ids into the process-wide actor registry.
pub type ActorId = u64;
/// Channel handles are integer ids into the process-wide channel registry.
pub type ChannelId = u64;

/// Signature of a builtin primitive: called with the evaluated argument
/// list, returns a value or an error cell. Never unwinds.
pub type BuiltinFn = fn(&mut EvalCtx, &Cell) -> Cell;

bitflags::bitflags! {
    /// Linear-type tracking used to enforce single-use discipline on marked
    /// values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Linear: u8 {
        /// Must be consumed exactly once.
        const UNIQUE   = 1 << 0;
        /// Temporary borrow.
        const BORROWED = 1 << 1;
        /// Already consumed; reading is an error.
        const CONSUMED = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Capability flags checked at runtime boundaries (actor send, channel
    /// send, box writes).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Caps: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        /// May cross actor boundaries in a message.
        const SEND    = 1 << 3;
        /// May be shared between threads.
        const SHARE   = 1 << 4;
    }
}

impl Caps {
    #[must_use]
    pub fn full() -> Self {
        Self::all()
    }
}

/// Structure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructKind {
    /// Simple non-recursive data.
    Leaf,
    /// Recursive data (ADT with variants).
    Node,
    /// Graph-shaped data.
    Graph,
}

/// Graph kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Generic,
    Cfg,
    Dfg,
    Call,
    Dep,
}

/// Lambda payload: a closure over an indexed environment with a De
/// Bruijn-converted body.
#[derive(Debug, Clone)]
pub struct Lambda {
    pub env: Cell,
    pub body: Cell,
    pub arity: usize,
    pub source: Option<SourceLoc>,
}

/// Where a lambda was defined, when the loader knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    pub module: Arc<str>,
    pub line: u32,
}

/// Builtin payload.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin").field("name", &self.name).finish()
    }
}

/// Error payload: a short kind name plus an optional data cell.
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub kind: Arc<str>,
    pub data: Cell,
}

/// Structure payload.
#[derive(Debug, Clone)]
pub struct StructData {
    pub kind: StructKind,
    pub type_tag: Cell,
    pub variant: Option<Cell>,
    /// Alist of `(field . value)` pairs.
    pub fields: Cell,
}

/// Graph payload.
#[derive(Debug, Clone)]
pub struct GraphData {
    pub kind: GraphKind,
    pub nodes: Cell,
    pub edges: Cell,
    pub metadata: Cell,
    pub entry: Option<Cell>,
    pub exit: Option<Cell>,
}

/// The discriminated union behind every [`Cell`].
#[derive(Debug)]
pub enum CellKind {
    Number(f64),
    Int(i64),
    Bool(bool),
    /// Symbols with a leading colon are keywords and self-evaluate.
    Symbol(Arc<str>),
    Str(Arc<str>),
    Nil,
    Pair(Cell, Cell),
    Lambda(Lambda),
    Builtin(Builtin),
    Error(ErrorData),
    Struct(StructData),
    Graph(GraphData),
    Actor(ActorId),
    Channel(ChannelId),
    /// Mutable box; the lock makes cross-actor swaps atomic.
    Box(Mutex<Cell>),
    /// Borrowed observation of another cell; does not extend its lifetime.
    WeakRef(Weak<CellInner>),
    /// Swiss-table hash map.
    Map(Mutex<CellMap>),
}

/// The reference-counted header: payload plus linear/capability flags and
/// the debug mark bit.
#[derive(Debug)]
pub struct CellInner {
    kind: CellKind,
    linear: AtomicU8,
    caps: AtomicU8,
    marked: AtomicU8,
}

/// A handle to a runtime value. Clone to retain, drop to release.
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

static_assertions::assert_impl_all!(Cell: Send, Sync);

// === constructors ===

impl Cell {
    fn from_kind(kind: CellKind) -> Self {
        Self {
            inner: Arc::new(CellInner {
                kind,
                linear: AtomicU8::new(Linear::empty().bits()),
                caps: AtomicU8::new(Caps::full().bits()),
                marked: AtomicU8::new(0),
            }),
        }
    }

    #[must_use]
    pub fn number(n: f64) -> Self {
        Self::from_kind(CellKind::Number(n))
    }

    #[must_use]
    pub fn int(n: i64) -> Self {
        Self::from_kind(CellKind::Int(n))
    }

    #[must_use]
    pub fn bool(b: bool) -> Self {
        Self::from_kind(CellKind::Bool(b))
    }

    #[must_use]
    pub fn symbol(name: &str) -> Self {
        Self::from_kind(CellKind::Symbol(Arc::from(name)))
    }

    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::from_kind(CellKind::Str(Arc::from(s)))
    }

    /// The nil singleton.
    #[must_use]
    pub fn nil() -> Self {
        static NIL: OnceLock<Cell> = OnceLock::new();
        NIL.get_or_init(|| Self::from_kind(CellKind::Nil)).clone()
    }

    #[must_use]
    pub fn cons(car: Cell, cdr: Cell) -> Self {
        Self::from_kind(CellKind::Pair(car, cdr))
    }

    #[must_use]
    pub fn lambda(env: Cell, body: Cell, arity: usize, source: Option<SourceLoc>) -> Self {
        Self::from_kind(CellKind::Lambda(Lambda {
            env,
            body,
            arity,
            source,
        }))
    }

    #[must_use]
    pub fn builtin(name: &'static str, func: BuiltinFn) -> Self {
        Self::from_kind(CellKind::Builtin(Builtin { name, func }))
    }

    #[must_use]
    pub fn error(kind: &str, data: Cell) -> Self {
        Self::from_kind(CellKind::Error(ErrorData {
            kind: Arc::from(kind),
            data,
        }))
    }

    #[must_use]
    pub fn structure(kind: StructKind, type_tag: Cell, variant: Option<Cell>, fields: Cell) -> Self {
        Self::from_kind(CellKind::Struct(StructData {
            kind,
            type_tag,
            variant,
            fields,
        }))
    }

    #[must_use]
    pub fn graph(kind: GraphKind, nodes: Cell, edges: Cell, metadata: Cell) -> Self {
        Self::from_kind(CellKind::Graph(GraphData {
            kind,
            nodes,
            edges,
            metadata,
            entry: None,
            exit: None,
        }))
    }

    #[must_use]
    pub fn actor(id: ActorId) -> Self {
        Self::from_kind(CellKind::Actor(id))
    }

    #[must_use]
    pub fn channel(id: ChannelId) -> Self {
        Self::from_kind(CellKind::Channel(id))
    }

    #[must_use]
    pub fn boxed(value: Cell) -> Self {
        Self::from_kind(CellKind::Box(Mutex::new(value)))
    }

    /// A weak reference observing `target` without retaining it.
    #[must_use]
    pub fn weak_ref(target: &Cell) -> Self {
        Self::from_kind(CellKind::WeakRef(Arc::downgrade(&target.inner)))
    }

    /// An empty hash map.
    #[must_use]
    pub fn map() -> Self {
        Self::from_kind(CellKind::Map(Mutex::new(CellMap::new())))
    }

    /// Build a proper list from the given cells.
    #[must_use]
    pub fn list<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Cell>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut out = Self::nil();
        for item in items.into_iter().rev() {
            out = Self::cons(item, out);
        }
        out
    }
}

// === accessors & predicates ===

impl Cell {
    #[must_use]
    pub fn kind(&self) -> &CellKind {
        &self.inner.kind
    }

    /// Current strong reference count (handles alive for this value).
    #[must_use]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Current weak reference count.
    #[must_use]
    pub fn weak_count(&self) -> usize {
        Arc::weak_count(&self.inner)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self.inner.kind, CellKind::Nil)
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(self.inner.kind, CellKind::Number(_))
    }

    #[must_use]
    pub fn is_int(&self) -> bool {
        matches!(self.inner.kind, CellKind::Int(_))
    }

    #[must_use]
    pub fn is_bool(&self) -> bool {
        matches!(self.inner.kind, CellKind::Bool(_))
    }

    #[must_use]
    pub fn is_symbol(&self) -> bool {
        matches!(self.inner.kind, CellKind::Symbol(_))
    }

    /// Keyword symbols carry a leading colon and self-evaluate.
    #[must_use]
    pub fn is_keyword(&self) -> bool {
        matches!(&self.inner.kind, CellKind::Symbol(s) if s.starts_with(':'))
    }

    #[must_use]
    pub fn is_string(&self) -> bool {
        matches!(self.inner.kind, CellKind::Str(_))
    }

    #[must_use]
    pub fn is_pair(&self) -> bool {
        matches!(self.inner.kind, CellKind::Pair(..))
    }

    #[must_use]
    pub fn is_lambda(&self) -> bool {
        matches!(self.inner.kind, CellKind::Lambda(_))
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        matches!(self.inner.kind, CellKind::Builtin(_))
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.inner.kind, CellKind::Error(_))
    }

    #[must_use]
    pub fn is_struct(&self) -> bool {
        matches!(self.inner.kind, CellKind::Struct(_))
    }

    #[must_use]
    pub fn is_graph(&self) -> bool {
        matches!(self.inner.kind, CellKind::Graph(_))
    }

    #[must_use]
    pub fn is_actor(&self) -> bool {
        matches!(self.inner.kind, CellKind::Actor(_))
    }

    #[must_use]
    pub fn is_channel(&self) -> bool {
        matches!(self.inner.kind, CellKind::Channel(_))
    }

    #[must_use]
    pub fn is_box(&self) -> bool {
        matches!(self.inner.kind, CellKind::Box(_))
    }

    #[must_use]
    pub fn is_weak_ref(&self) -> bool {
        matches!(self.inner.kind, CellKind::WeakRef(_))
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self.inner.kind, CellKind::Map(_))
    }

    /// `true` only for the boolean `true`; everything else is falsy to the
    /// conditional form.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        matches!(self.inner.kind, CellKind::Bool(true))
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self.inner.kind {
            CellKind::Number(n) => Some(n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self.inner.kind {
            CellKind::Int(n) => Some(n),
            _ => None,
        }
    }

    /// Numeric value of either numeric variant.
    #[must_use]
    #[expect(clippy::cast_precision_loss, reason = "language-level numeric widening")]
    pub fn as_f64(&self) -> Option<f64> {
        match self.inner.kind {
            CellKind::Number(n) => Some(n),
            CellKind::Int(n) => Some(n as f64),
            _ => None,
        }
    }

    /// Non-negative integral value, from either numeric variant. Used for De
    /// Bruijn lookups; negative or fractional numbers report `None`.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "fract check precedes cast")]
    #[expect(clippy::cast_sign_loss, reason = "sign check precedes cast")]
    pub fn as_index(&self) -> Option<usize> {
        match self.inner.kind {
            CellKind::Int(n) if n >= 0 => Some(n as usize),
            CellKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as usize),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.inner.kind {
            CellKind::Bool(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_symbol(&self) -> Option<&str> {
        match &self.inner.kind {
            CellKind::Symbol(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match &self.inner.kind {
            CellKind::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_pair(&self) -> Option<(&Cell, &Cell)> {
        match &self.inner.kind {
            CellKind::Pair(car, cdr) => Some((car, cdr)),
            _ => None,
        }
    }

    /// Head of a pair, or `None`.
    #[must_use]
    pub fn car(&self) -> Option<&Cell> {
        self.as_pair().map(|(car, _)| car)
    }

    /// Tail of a pair, or `None`.
    #[must_use]
    pub fn cdr(&self) -> Option<&Cell> {
        self.as_pair().map(|(_, cdr)| cdr)
    }

    #[must_use]
    pub fn as_lambda(&self) -> Option<&Lambda> {
        match &self.inner.kind {
            CellKind::Lambda(l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_builtin(&self) -> Option<&Builtin> {
        match &self.inner.kind {
            CellKind::Builtin(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&ErrorData> {
        match &self.inner.kind {
            CellKind::Error(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        self.as_error().map(|e| &*e.kind)
    }

    #[must_use]
    pub fn as_struct(&self) -> Option<&StructData> {
        match &self.inner.kind {
            CellKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_graph(&self) -> Option<&GraphData> {
        match &self.inner.kind {
            CellKind::Graph(g) => Some(g),
            _ => None,
        }
    }

    #[must_use]
    pub fn actor_id(&self) -> Option<ActorId> {
        match self.inner.kind {
            CellKind::Actor(id) => Some(id),
            _ => None,
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self.inner.kind {
            CellKind::Channel(id) => Some(id),
            _ => None,
        }
    }

    /// Read the current contents of a mutable box.
    #[must_use]
    pub fn box_get(&self) -> Option<Cell> {
        match &self.inner.kind {
            CellKind::Box(slot) => Some(slot.lock().clone()),
            _ => None,
        }
    }

    /// Swap the contents of a mutable box, returning the previous value.
    /// Requires the `WRITE` capability.
    pub fn box_set(&self, value: Cell) -> Result<Cell, Cell> {
        match &self.inner.kind {
            CellKind::Box(slot) => {
                if !self.can(Caps::WRITE) {
                    return Err(Cell::error("cap-denied", self.clone()));
                }
                Ok(std::mem::replace(&mut *slot.lock(), value))
            }
            _ => Err(Cell::error("not-a-box", self.clone())),
        }
    }

    /// Dereference a weak reference: the target if it is still strongly
    /// alive, nil otherwise. Verified atomically against the strong count.
    #[must_use]
    pub fn weak_deref(&self) -> Option<Cell> {
        match &self.inner.kind {
            CellKind::WeakRef(weak) => Some(
                weak.upgrade()
                    .map_or_else(Cell::nil, |inner| Cell { inner }),
            ),
            _ => None,
        }
    }
}

// === linear & capability flags ===

impl Cell {
    #[must_use]
    pub fn linear(&self) -> Linear {
        Linear::from_bits_truncate(self.inner.linear.load(Ordering::Acquire))
    }

    pub fn set_linear(&self, flags: Linear) {
        self.inner.linear.store(flags.bits(), Ordering::Release);
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.linear().contains(Linear::UNIQUE)
    }

    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.linear().contains(Linear::CONSUMED)
    }

    /// Mark a linear value as consumed. Returns `false` if it was already
    /// consumed.
    pub fn consume(&self) -> bool {
        let prev = self
            .inner
            .linear
            .fetch_or(Linear::CONSUMED.bits(), Ordering::AcqRel);
        !Linear::from_bits_truncate(prev).contains(Linear::CONSUMED)
    }

    /// Mark as a temporary borrow.
    pub fn borrow_linear(&self) {
        self.inner
            .linear
            .fetch_or(Linear::BORROWED.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn caps(&self) -> Caps {
        Caps::from_bits_truncate(self.inner.caps.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn can(&self, caps: Caps) -> bool {
        self.caps().contains(caps)
    }

    /// Remove capabilities from this value.
    pub fn deny(&self, caps: Caps) {
        self.inner.caps.fetch_and(!caps.bits(), Ordering::AcqRel);
    }

    /// Grant capabilities to this value.
    pub fn allow(&self, caps: Caps) {
        self.inner.caps.fetch_or(caps.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_marked(&self) -> bool {
        self.inner.marked.load(Ordering::Acquire) != 0
    }

    pub fn set_marked(&self, marked: bool) {
        self.inner.marked.store(u8::from(marked), Ordering::Release);
    }
}

// === lists ===

/// Iterator over the pair spine of a proper list. Stops at the first
/// non-pair tail.
pub struct ListIter {
    cursor: Cell,
}

impl Iterator for ListIter {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        let (car, cdr) = self.cursor.as_pair()?;
        let item = car.clone();
        let next = cdr.clone();
        self.cursor = next;
        Some(item)
    }
}

impl Cell {
    /// Iterate over the items of a proper list.
    #[must_use]
    pub fn iter_list(&self) -> ListIter {
        ListIter {
            cursor: self.clone(),
        }
    }

    /// Number of items in the pair spine.
    #[must_use]
    pub fn list_len(&self) -> usize {
        self.iter_list().count()
    }

    /// The `index`-th item of a proper list.
    #[must_use]
    pub fn list_nth(&self, index: usize) -> Option<Cell> {
        self.iter_list().nth(index)
    }
}

// === equality & hashing ===

fn opaque_eq(a: &Cell, b: &Cell) -> bool {
    a.ptr_eq(b)
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        use CellKind as K;
        match (&self.inner.kind, &other.inner.kind) {
            (K::Number(a), K::Number(b)) => a == b,
            (K::Int(a), K::Int(b)) => a == b,
            (K::Bool(a), K::Bool(b)) => a == b,
            (K::Symbol(a), K::Symbol(b)) => a == b,
            (K::Str(a), K::Str(b)) => a == b,
            (K::Nil, K::Nil) => true,
            (K::Pair(..), K::Pair(..)) => {
                // Iterative over the spine; recursive only into heads.
                let mut a = self.clone();
                let mut b = other.clone();
                loop {
                    let a_pair = a.as_pair().map(|(h, t)| (h.clone(), t.clone()));
                    let b_pair = b.as_pair().map(|(h, t)| (h.clone(), t.clone()));
                    match (a_pair, b_pair) {
                        (Some((ah, at)), Some((bh, bt))) => {
                            if ah != bh {
                                return false;
                            }
                            a = at;
                            b = bt;
                        }
                        (None, None) => return a == b,
                        _ => return false,
                    }
                }
            }
            (K::Error(a), K::Error(b)) => a.kind == b.kind && a.data == b.data,
            (K::Struct(a), K::Struct(b)) => {
                a.kind == b.kind
                    && a.type_tag == b.type_tag
                    && a.variant == b.variant
                    && a.fields == b.fields
            }
            (K::Graph(a), K::Graph(b)) => {
                a.kind == b.kind
                    && a.nodes == b.nodes
                    && a.edges == b.edges
                    && a.metadata == b.metadata
                    && a.entry == b.entry
                    && a.exit == b.exit
            }
            (K::Actor(a), K::Actor(b)) => a == b,
            (K::Channel(a), K::Channel(b)) => a == b,
            (K::Lambda(_), K::Lambda(_))
            | (K::Builtin(_), K::Builtin(_))
            | (K::Box(_), K::Box(_))
            | (K::WeakRef(_), K::WeakRef(_))
            | (K::Map(_), K::Map(_)) => opaque_eq(self, other),
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        use CellKind as K;
        std::mem::discriminant(&self.inner.kind).hash(state);
        match &self.inner.kind {
            K::Number(n) => {
                // Normalize -0.0 so hashing agrees with equality.
                let bits = if *n == 0.0 { 0u64 } else { n.to_bits() };
                bits.hash(state);
            }
            K::Int(n) => n.hash(state),
            K::Bool(b) => b.hash(state),
            K::Symbol(s) | K::Str(s) => s.hash(state),
            K::Nil => {}
            K::Pair(..) => {
                for item in self.iter_list() {
                    item.hash(state);
                }
            }
            K::Error(e) => {
                e.kind.hash(state);
                e.data.hash(state);
            }
            K::Struct(s) => {
                s.type_tag.hash(state);
                s.variant.hash(state);
                s.fields.hash(state);
            }
            K::Graph(g) => {
                g.nodes.hash(state);
                g.edges.hash(state);
            }
            K::Actor(id) | K::Channel(id) => id.hash(state),
            K::Lambda(_) | K::Builtin(_) | K::Box(_) | K::WeakRef(_) | K::Map(_) => {
                Arc::as_ptr(&self.inner).hash(state);
            }
        }
    }
}

// === structures & graphs ===

impl Cell {
    /// Look up a field of a structure by name in its field alist.
    #[must_use]
    pub fn struct_field(&self, name: &Cell) -> Option<Cell> {
        let data = self.as_struct()?;
        for binding in data.fields.iter_list() {
            if let Some((key, value)) = binding.as_pair()
                && key == name
            {
                return Some(value.clone());
            }
        }
        None
    }

    /// Functional update: a new graph with `node` prepended.
    #[must_use]
    pub fn graph_add_node(&self, node: Cell) -> Option<Cell> {
        let g = self.as_graph()?;
        let mut next = g.clone();
        next.nodes = Cell::cons(node, g.nodes.clone());
        Some(Self::from_kind(CellKind::Graph(next)))
    }

    /// Functional update: a new graph with the edge `(from to label)`
    /// prepended.
    #[must_use]
    pub fn graph_add_edge(&self, from: Cell, to: Cell, label: Cell) -> Option<Cell> {
        let g = self.as_graph()?;
        let mut next = g.clone();
        next.edges = Cell::cons(Cell::list([from, to, label]), g.edges.clone());
        Some(Self::from_kind(CellKind::Graph(next)))
    }

    /// Functional update: a new graph with the entry node set.
    #[must_use]
    pub fn graph_with_entry(&self, entry: Cell) -> Option<Cell> {
        let g = self.as_graph()?;
        let mut next = g.clone();
        next.entry = Some(entry);
        Some(Self::from_kind(CellKind::Graph(next)))
    }

    /// Functional update: a new graph with the exit node set.
    #[must_use]
    pub fn graph_with_exit(&self, exit: Cell) -> Option<Cell> {
        let g = self.as_graph()?;
        let mut next = g.clone();
        next.exit = Some(exit);
        Some(Self::from_kind(CellKind::Graph(next)))
    }
}

// === drop ===

impl Drop for CellInner {
    fn drop(&mut self) {
        // Steal the tail of a pair chain and release it iteratively. A
        // naive recursive drop of a long list would exhaust the native
        // stack.
        let CellKind::Pair(_, cdr) = &mut self.kind else {
            return;
        };
        let mut tail = std::mem::replace(cdr, Cell::nil());
        loop {
            match Arc::try_unwrap(tail.inner) {
                Ok(mut inner) => {
                    if let CellKind::Pair(_, next) = &mut inner.kind {
                        tail = Cell {
                            inner: std::mem::replace(next, Cell::nil()).inner,
                        };
                        // `inner` drops here with a nil tail: no recursion.
                    } else {
                        break;
                    }
                }
                // Shared elsewhere; the other handle keeps it alive.
                Err(_) => break,
            }
        }
    }
}

// === formatting ===

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CellKind as K;
        match &self.inner.kind {
            K::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{n:.0}")
                } else {
                    write!(f, "{n}")
                }
            }
            K::Int(n) => write!(f, "{n}"),
            K::Bool(b) => write!(f, "{b}"),
            K::Symbol(s) => write!(f, "{s}"),
            K::Str(s) => write!(f, "{s:?}"),
            K::Nil => write!(f, "nil"),
            K::Pair(..) => {
                write!(f, "(")?;
                let mut cursor = self.clone();
                let mut first = true;
                loop {
                    let pair = cursor.as_pair().map(|(h, t)| (h.clone(), t.clone()));
                    match pair {
                        Some((car, cdr)) => {
                            if !first {
                                write!(f, " ")?;
                            }
                            write!(f, "{car}")?;
                            first = false;
                            cursor = cdr;
                        }
                        None => {
                            if !cursor.is_nil() {
                                write!(f, " . {cursor}")?;
                            }
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            K::Lambda(l) => write!(f, "#<lambda/{}>", l.arity),
            K::Builtin(b) => write!(f, "#<builtin {}>", b.name),
            K::Error(e) => write!(f, "#<error {} {}>", e.kind, e.data),
            K::Struct(s) => {
                write!(f, "#<struct {}", s.type_tag)?;
                if let Some(variant) = &s.variant {
                    write!(f, " {variant}")?;
                }
                write!(f, " {}>", s.fields)
            }
            K::Graph(g) => write!(f, "#<graph {} nodes {}>", g.kind_name(), g.nodes.list_len()),
            K::Actor(id) => write!(f, "#<actor {id}>"),
            K::Channel(id) => write!(f, "#<channel {id}>"),
            K::Box(slot) => write!(f, "#<box {}>", slot.lock()),
            K::WeakRef(weak) => {
                if weak.strong_count() > 0 {
                    write!(f, "#<weak live>")
                } else {
                    write!(f, "#<weak gone>")
                }
            }
            K::Map(map) => write!(f, "#<map/{}>", map.lock().len()),
        }
    }
}

impl GraphData {
    fn kind_name(&self) -> &'static str {
        match self.kind {
            GraphKind::Generic => "generic",
            GraphKind::Cfg => "cfg",
            GraphKind::Dfg => "dfg",
            GraphKind::Call => "call",
            GraphKind::Dep => "dep",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_release_balances() {
        let v = Cell::int(42);
        assert_eq!(v.strong_count(), 1);
        let retained = v.clone();
        assert_eq!(v.strong_count(), 2);
        drop(retained);
        assert_eq!(v.strong_count(), 1);
    }

    #[test]
    fn n_retains_then_n_releases() {
        let v = Cell::string("shared");
        let handles: Vec<Cell> = (0..8).map(|_| v.clone()).collect();
        assert_eq!(v.strong_count(), 9);
        drop(handles);
        assert_eq!(v.strong_count(), 1);
    }

    #[test]
    fn weak_observes_target_gone() {
        let v = Cell::int(7);
        let weak = Cell::weak_ref(&v);
        assert_eq!(weak.weak_deref().unwrap(), v);
        drop(v);
        assert!(weak.weak_deref().unwrap().is_nil());
    }

    #[test]
    fn children_retained_on_construction() {
        let head = Cell::int(1);
        let pair = Cell::cons(head.clone(), Cell::nil());
        assert_eq!(head.strong_count(), 2);
        drop(pair);
        assert_eq!(head.strong_count(), 1);
    }

    #[test]
    fn deep_list_drop_does_not_recurse() {
        let mut list = Cell::nil();
        for i in 0..1_000_000 {
            list = Cell::cons(Cell::int(i), list);
        }
        drop(list);
    }

    #[test]
    fn structural_equality_is_deep() {
        let a = Cell::list([Cell::int(1), Cell::list([Cell::symbol("x")])]);
        let b = Cell::list([Cell::int(1), Cell::list([Cell::symbol("x")])]);
        let c = Cell::list([Cell::int(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Reflexive + symmetric.
        assert_eq!(a, a);
        assert_eq!(b, a);
    }

    #[test]
    fn opaque_variants_compare_by_identity() {
        let a = Cell::boxed(Cell::int(1));
        let b = Cell::boxed(Cell::int(1));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn numeric_variants_are_distinct() {
        assert_ne!(Cell::int(3), Cell::number(3.0));
        assert_eq!(Cell::int(3).as_f64(), Cell::number(3.0).as_f64());
    }

    #[test]
    fn consumed_values_stay_consumed() {
        let v = Cell::int(1);
        v.set_linear(Linear::UNIQUE);
        assert!(v.consume());
        assert!(!v.consume());
        assert!(v.is_consumed());
    }

    #[test]
    fn caps_gate_box_writes() {
        let b = Cell::boxed(Cell::int(1));
        b.deny(Caps::WRITE);
        assert!(b.box_set(Cell::int(2)).is_err());
        b.allow(Caps::WRITE);
        assert_eq!(b.box_set(Cell::int(2)).unwrap(), Cell::int(1));
        assert_eq!(b.box_get().unwrap(), Cell::int(2));
    }

    #[test]
    fn list_iteration() {
        let l = Cell::list([Cell::int(1), Cell::int(2), Cell::int(3)]);
        let items: Vec<Cell> = l.iter_list().collect();
        assert_eq!(items.len(), 3);
        assert_eq!(l.list_len(), 3);
        assert_eq!(l.list_nth(1), Some(Cell::int(2)));
    }

    #[test]
    fn display_renders_sexprs() {
        let l = Cell::list([Cell::symbol("f"), Cell::int(1), Cell::string("s")]);
        assert_eq!(l.to_string(), "(f 1 \"s\")");
        assert_eq!(Cell::cons(Cell::int(1), Cell::int(2)).to_string(), "(1 . 2)");
    }
}
