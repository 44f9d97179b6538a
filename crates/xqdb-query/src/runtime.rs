use crate::expr::order::EmptyOrder;
use crate::expr::{Var, VarId};
use crate::ft::options::FTOptions;
use crate::ft::scoring::Scoring;
use crate::index::IndexProvider;
use crate::model::{NodeId, Storage};
use crate::update::UpdateCollector;
use crate::xdm::{ExpandedName, SharedSequence, XdmItem, XdmSequence};
use core::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Namespace URI used for W3C-defined XPath/XQuery error codes (xqt-errors).
pub const ERR_NS: &str = "http://www.w3.org/2005/xqt-errors";
/// Namespace of project specific error codes.
pub const DB_ERR_NS: &str = "http://xqdb.org/errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Arithmetic
    FOAR0001, // division by zero
    FOAR0002, // numeric overflow
    // Casting / arguments
    FOCA0002, // invalid lexical value
    FOER0000, // unidentified error (fn:error default)
    FORG0001, // invalid value for cast
    FORG0003, // zero-or-one violated
    FORG0004, // one-or-more violated
    FORG0005, // exactly-one violated
    FORG0006, // invalid argument type (EBV)
    // Static / type
    XPST0005, // static type is empty where a value is required
    XPST0008, // undeclared variable
    XPST0017, // unknown function or wrong number of arguments
    XPTY0004, // type error
    XPTY0019, // path step applied to non-node
    XPTY0020, // context item of axis step is not a node
    XPDY0002, // context item undefined
    XPDY0050, // treat as failed
    // Full text
    FTDY0016, // weight out of range
    FTDY0017, // mild not applied to exclusions
    // Updates
    XUST0001, // updating expression in non-updating position
    XUTY0005, // insert target not a single element/document
    XUTY0006, // insert before/after target not a single node with parent
    XUTY0007, // delete target not a node
    XUTY0008, // replace target not a single node
    XUTY0010, // replacement of a non-attribute contains attributes
    XUTY0011, // replacement of an attribute contains other nodes
    XUTY0012, // rename target of wrong kind
    XUTY0013, // insert source: attributes after other nodes
    XUDY0009, // replace target has no parent
    XUDY0015, // multiple renames of the same node
    XUDY0016, // multiple replaces of the same node
    XUDY0017, // multiple value replacements of the same node
    XUDY0021, // duplicate attribute after applying updates
    XUDY0023, // namespace conflict on rename
    XUDY0027, // target expression empty
    // Project specific
    BXQU0001, // evaluation interrupted
    BXQU0002, // empty sequence where exactly one item is required
    Unknown,
}

/// ErrorCode notes:
/// - Only the codes raised by this crate are modelled; user defined codes
///   from `fn:error` are kept as QNames on [`Error::code`].
/// - Use `Error::code_enum()` for structured handling instead of matching raw strings.
impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FOAR0001 => "FOAR0001",
            ErrorCode::FOAR0002 => "FOAR0002",
            ErrorCode::FOCA0002 => "FOCA0002",
            ErrorCode::FOER0000 => "FOER0000",
            ErrorCode::FORG0001 => "FORG0001",
            ErrorCode::FORG0003 => "FORG0003",
            ErrorCode::FORG0004 => "FORG0004",
            ErrorCode::FORG0005 => "FORG0005",
            ErrorCode::FORG0006 => "FORG0006",
            ErrorCode::XPST0005 => "XPST0005",
            ErrorCode::XPST0008 => "XPST0008",
            ErrorCode::XPST0017 => "XPST0017",
            ErrorCode::XPTY0004 => "XPTY0004",
            ErrorCode::XPTY0019 => "XPTY0019",
            ErrorCode::XPTY0020 => "XPTY0020",
            ErrorCode::XPDY0002 => "XPDY0002",
            ErrorCode::XPDY0050 => "XPDY0050",
            ErrorCode::FTDY0016 => "FTDY0016",
            ErrorCode::FTDY0017 => "FTDY0017",
            ErrorCode::XUST0001 => "XUST0001",
            ErrorCode::XUTY0005 => "XUTY0005",
            ErrorCode::XUTY0006 => "XUTY0006",
            ErrorCode::XUTY0007 => "XUTY0007",
            ErrorCode::XUTY0008 => "XUTY0008",
            ErrorCode::XUTY0010 => "XUTY0010",
            ErrorCode::XUTY0011 => "XUTY0011",
            ErrorCode::XUTY0012 => "XUTY0012",
            ErrorCode::XUTY0013 => "XUTY0013",
            ErrorCode::XUDY0009 => "XUDY0009",
            ErrorCode::XUDY0015 => "XUDY0015",
            ErrorCode::XUDY0016 => "XUDY0016",
            ErrorCode::XUDY0017 => "XUDY0017",
            ErrorCode::XUDY0021 => "XUDY0021",
            ErrorCode::XUDY0023 => "XUDY0023",
            ErrorCode::XUDY0027 => "XUDY0027",
            ErrorCode::BXQU0001 => "BXQU0001",
            ErrorCode::BXQU0002 => "BXQU0002",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    /// Returns the QName (ExpandedName) for this error code.
    pub fn qname(&self) -> ExpandedName {
        let ns = match self {
            ErrorCode::BXQU0001 | ErrorCode::BXQU0002 => DB_ERR_NS,
            _ => ERR_NS,
        };
        ExpandedName::new(Some(ns.to_string()), self.as_str())
    }

    pub fn from_local(s: &str) -> Self {
        use ErrorCode::*;
        [
            FOAR0001, FOAR0002, FOCA0002, FOER0000, FORG0001, FORG0003, FORG0004, FORG0005,
            FORG0006, XPST0005, XPST0008, XPST0017, XPTY0004, XPTY0019, XPTY0020, XPDY0002, XPDY0050,
            FTDY0016, FTDY0017, XUST0001, XUTY0005, XUTY0006, XUTY0007, XUTY0008, XUTY0010,
            XUTY0011, XUTY0012, XUTY0013, XUDY0009, XUDY0015, XUDY0016, XUDY0017, XUDY0021,
            XUDY0023, XUDY0027,
            BXQU0001, BXQU0002,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
        .unwrap_or(Unknown)
    }

    /// Classification derived from the code family.
    pub fn kind(&self) -> ErrorKind {
        let s = self.as_str();
        if *self == ErrorCode::BXQU0001 {
            ErrorKind::Cancelled
        } else if s.starts_with("XPST") || s.starts_with("XUST") {
            ErrorKind::Static
        } else if s.starts_with("XPTY") || s.starts_with("XUTY") || *self == ErrorCode::BXQU0002 {
            ErrorKind::Type
        } else if s.starts_with("XUDY") {
            ErrorKind::Update
        } else {
            ErrorKind::Dynamic
        }
    }
}

/// Coarse error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Detected without data; aborts compilation.
    Static,
    /// Type mismatch (statically or dynamically detected).
    Type,
    /// Raised while evaluating.
    Dynamic,
    /// Conflicting or illegal update primitives.
    Update,
    /// Cooperative cancellation; never caught by `try/catch`.
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub struct Error {
    pub code: ExpandedName,
    pub kind: ErrorKind,
    pub message: String,
    /// Error object passed to `fn:error`, bound to `$err:value` in catch clauses.
    pub value: Option<XdmSequence>,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// QName-centric constructor for user defined codes.
    pub fn new_qname(code: ExpandedName, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: msg.into(),
            value: None,
            source: None,
        }
    }

    pub fn from_code(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self::new_qname(code.qname(), code.kind(), msg)
    }

    pub fn type_err(msg: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::XPTY0004, msg)
    }

    /// An operand that must yield one item yielded none.
    pub fn empty_sequence(msg: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::BXQU0002, msg)
    }

    pub fn cancelled() -> Self {
        Self::from_code(ErrorCode::BXQU0001, "query was interrupted")
    }

    pub fn with_value(mut self, value: XdmSequence) -> Self {
        self.value = Some(value);
        self
    }

    /// Compose an error with a source cause.
    pub fn with_source(
        mut self,
        source: impl Into<Option<Arc<dyn std::error::Error + Send + Sync>>>,
    ) -> Self {
        self.source = source.into();
        self
    }

    pub fn code_enum(&self) -> ErrorCode {
        match self.code.ns_uri.as_deref() {
            Some(ERR_NS) | Some(DB_ERR_NS) => ErrorCode::from_local(&self.code.local),
            _ => ErrorCode::Unknown,
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code_enum() == code
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Format the code as a human-readable string (err:LOCAL or Q{ns}local).
    pub fn format_code(&self) -> String {
        if self.code.ns_uri.as_deref() == Some(ERR_NS) {
            format!("err:{}", self.code.local)
        } else {
            self.code.to_string()
        }
    }
}

impl From<fancy_regex::Error> for Error {
    fn from(e: fancy_regex::Error) -> Self {
        Error::from_code(ErrorCode::FOER0000, "invalid wildcard pattern")
            .with_source(Some(Arc::new(e) as Arc<dyn std::error::Error + Send + Sync>))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error: {} ({})", self.message, self.format_code())
    }
}

/// Cooperative cancellation handle shared between the evaluating thread and
/// whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, AtomicOrdering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Rewrite predicates to index lookups during compilation.
    pub index_rewrite: bool,
    /// Evaluate constant sub-expressions at compile time.
    pub fold_constants: bool,
    /// Full-text options in effect outside any `using` clause.
    pub ft: FTOptions,
    pub scoring: Scoring,
    /// Placement of empty order keys when a clause does not say.
    pub empty_order: EmptyOrder,
    pub interrupt: Option<Interrupt>,
    /// Number of checkpoints between two looks at the interrupt flag.
    pub checkpoint_interval: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            index_rewrite: true,
            fold_constants: true,
            ft: FTOptions::default(),
            scoring: Scoring::default(),
            empty_order: EmptyOrder::Least,
            interrupt: None,
            checkpoint_interval: 1024,
        }
    }
}

impl QueryOptions {
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptionsBuilder {
    opts: QueryOptions,
}

impl QueryOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index_rewrite(mut self, on: bool) -> Self {
        self.opts.index_rewrite = on;
        self
    }

    pub fn with_constant_folding(mut self, on: bool) -> Self {
        self.opts.fold_constants = on;
        self
    }

    pub fn with_ft_options(mut self, ft: FTOptions) -> Self {
        self.opts.ft = ft;
        self
    }

    pub fn with_scoring(mut self, scoring: Scoring) -> Self {
        self.opts.scoring = scoring;
        self
    }

    pub fn with_empty_order(mut self, order: EmptyOrder) -> Self {
        self.opts.empty_order = order;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.opts.interrupt = Some(interrupt);
        self
    }

    pub fn with_checkpoint_interval(mut self, every: u32) -> Self {
        self.opts.checkpoint_interval = every.max(1);
        self
    }

    pub fn build(self) -> QueryOptions {
        self.opts
    }
}

/// Context item, position and size (`.`, `position()`, `last()`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Focus {
    pub item: Option<XdmItem>,
    pub pos: usize,
    pub size: usize,
}

impl Focus {
    pub fn new(item: XdmItem, pos: usize, size: usize) -> Self {
        Self {
            item: Some(item),
            pos,
            size,
        }
    }
}

/// Per-query evaluation state. One context serves exactly one
/// compile+evaluate cycle and is never shared across threads.
pub struct QueryContext<'a> {
    store: &'a dyn Storage,
    index: Option<&'a dyn IndexProvider>,
    options: QueryOptions,
    vars: Vec<(VarId, SharedSequence)>,
    namespaces: Vec<(String, String)>,
    ft: FTOptions,
    scoring: Scoring,
    focus: Focus,
    updates: UpdateCollector,
    ticks: u32,
}

impl<'a> QueryContext<'a> {
    pub fn new(store: &'a dyn Storage) -> Self {
        Self::with_options(store, QueryOptions::default())
    }

    pub fn with_options(store: &'a dyn Storage, options: QueryOptions) -> Self {
        Self {
            store,
            index: None,
            ft: options.ft.clone(),
            scoring: options.scoring,
            options,
            vars: Vec::new(),
            namespaces: vec![("xml".into(), "http://www.w3.org/XML/1998/namespace".into())],
            focus: Focus::default(),
            updates: UpdateCollector::default(),
            ticks: 0,
        }
    }

    pub fn with_index(mut self, index: &'a dyn IndexProvider) -> Self {
        self.index = Some(index);
        self
    }

    /// Set the initial context item to the document node of the store.
    pub fn with_document_context(mut self) -> Self {
        let root = self.store.root();
        self.focus = Focus::new(XdmItem::Node(root), 1, 1);
        self
    }

    pub fn with_context_item(mut self, item: XdmItem) -> Self {
        self.focus = Focus::new(item, 1, 1);
        self
    }

    pub fn store(&self) -> &'a dyn Storage {
        self.store
    }

    pub fn index(&self) -> Option<&'a dyn IndexProvider> {
        self.index
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn focus(&self) -> &Focus {
        &self.focus
    }

    pub fn context_item(&self) -> Result<&XdmItem, Error> {
        self.focus
            .item
            .as_ref()
            .ok_or_else(|| Error::from_code(ErrorCode::XPDY0002, "context item is undefined"))
    }

    pub fn context_node(&self) -> Result<NodeId, Error> {
        match self.context_item()? {
            XdmItem::Node(n) => Ok(*n),
            XdmItem::Atomic(_) => Err(Error::from_code(
                ErrorCode::XPTY0020,
                "context item is not a node",
            )),
        }
    }

    pub fn var(&self, var: &Var) -> Result<SharedSequence, Error> {
        self.vars
            .iter()
            .rev()
            .find(|(id, _)| *id == var.id)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| {
                Error::from_code(
                    ErrorCode::XPST0008,
                    format!("variable ${} is not bound", var.name),
                )
            })
    }

    /// Bind a variable on top of the current frame. Use inside a [`Scope`]
    /// so the binding disappears when the scope ends.
    pub fn bind(&mut self, var: &Var, value: impl Into<SharedSequence>) {
        self.vars.push((var.id, value.into()));
    }

    pub(crate) fn bind_id(&mut self, id: VarId, value: SharedSequence) {
        self.vars.push((id, value));
    }

    /// Bind an externally supplied variable for the whole query.
    pub fn declare(&mut self, var: &Var, value: XdmSequence) {
        self.vars.push((var.id, value.into()));
    }

    pub fn resolve_prefix(&self, prefix: &str) -> Option<&str> {
        self.namespaces
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    pub fn ft_options(&self) -> &FTOptions {
        &self.ft
    }

    pub fn scoring(&self) -> Scoring {
        self.scoring
    }

    pub fn updates(&self) -> &UpdateCollector {
        &self.updates
    }

    pub fn updates_mut(&mut self) -> &mut UpdateCollector {
        &mut self.updates
    }

    /// Hand the collected updates to the caller; the context keeps an empty collector.
    pub fn take_updates(&mut self) -> UpdateCollector {
        std::mem::take(&mut self.updates)
    }

    /// Cancellation checkpoint for tight loops.
    pub fn checkpoint(&mut self) -> Result<(), Error> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % self.options.checkpoint_interval.max(1) == 0
            && let Some(flag) = &self.options.interrupt
            && flag.is_triggered()
        {
            tracing::warn!(ticks = self.ticks, "evaluation interrupted");
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Open a variable scope; bindings made through it are dropped on exit.
    pub fn scope(&mut self) -> Scope<'_, 'a> {
        let mark = self.vars.len();
        Scope {
            ctx: self,
            saved: Saved::Vars(mark),
        }
    }

    /// Replace the focus until the returned guard is dropped.
    pub fn focus_scope(&mut self, focus: Focus) -> Scope<'_, 'a> {
        let prev = std::mem::replace(&mut self.focus, focus);
        Scope {
            ctx: self,
            saved: Saved::Focus(prev),
        }
    }

    /// Replace the full-text options until the returned guard is dropped.
    pub fn ft_scope(&mut self, ft: FTOptions) -> Scope<'_, 'a> {
        let prev = std::mem::replace(&mut self.ft, ft);
        Scope {
            ctx: self,
            saved: Saved::FullText(prev),
        }
    }

    /// Push namespace bindings until the returned guard is dropped.
    pub fn ns_scope(&mut self, bindings: &[(String, String)]) -> Scope<'_, 'a> {
        let mark = self.namespaces.len();
        self.namespaces.extend(bindings.iter().cloned());
        Scope {
            ctx: self,
            saved: Saved::Namespaces(mark),
        }
    }
}

enum Saved {
    Vars(usize),
    Focus(Focus),
    FullText(FTOptions),
    Namespaces(usize),
}

/// Scoped mutation of a [`QueryContext`]; restores the previous state on drop.
pub struct Scope<'c, 'a> {
    ctx: &'c mut QueryContext<'a>,
    saved: Saved,
}

impl<'a> Deref for Scope<'_, 'a> {
    type Target = QueryContext<'a>;
    fn deref(&self) -> &Self::Target {
        &*self.ctx
    }
}

impl DerefMut for Scope<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.ctx
    }
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        match &mut self.saved {
            Saved::Vars(mark) => self.ctx.vars.truncate(*mark),
            Saved::Focus(prev) => self.ctx.focus = std::mem::take(prev),
            Saved::FullText(prev) => self.ctx.ft = std::mem::take(prev),
            Saved::Namespaces(mark) => self.ctx.namespaces.truncate(*mark),
        }
    }
}
