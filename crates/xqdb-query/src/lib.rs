//! Query compiler and lazy evaluator of an embedded XML database.
//!
//! Queries arrive as [`Expr`] trees. [`Expr::compile`] simplifies them and
//! rewrites index-accessible location paths; [`Expr::iter`] streams results.
//! Node storage and indexes are collaborators behind the [`Storage`] and
//! [`IndexProvider`] traits.
pub mod expr;
pub mod ft;
pub mod functions;
pub mod index;
pub mod model;
pub mod optimize;
pub mod runtime;
pub mod sequence;
pub mod simple_store;
pub mod update;
pub mod xdm;

pub use expr::{Expr, Var};
pub use ft::{FTContains, FTExpr, FTMode};
pub use functions::{Builtin, FnCall};
pub use index::{IndexProvider, IndexQuery, MemIndex};
pub use model::{Fragment, NodeId, NodeKind, QName, Storage, StorageMut};
pub use runtime::{
    Error, ErrorCode, ErrorKind, Interrupt, QueryContext, QueryOptions, QueryOptionsBuilder,
};
pub use simple_store::{SimpleStore, attr, comment, doc, elem, elem_ns, pi, text};
pub use update::{UpdateCollector, apply_updates};
pub use xdm::{ExpandedName, XdmAtomicValue, XdmItem, XdmSequence};

/// Compile `expr` and evaluate it to a materialized sequence.
pub fn evaluate(expr: Expr, ctx: &mut QueryContext<'_>) -> Result<XdmSequence, Error> {
    let compiled = expr.compile(ctx)?;
    compiled.value(ctx)
}
