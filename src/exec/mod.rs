// # Query Execution
//
// The plan-tree interpreter and its passes: expression evaluation,
// aggregation, group-by, order-by, hierarchical queries, and the DML
// procedures.

pub mod connect_by;
pub mod dml;
pub mod eval;
pub mod group_by;
pub mod interpreter;
pub mod order_by;
pub mod regu;
pub mod xasl;

pub use interpreter::{execute_plan, ExecContext, ExecOptions};
pub use regu::{CmpOp, EvalEnv, PredExpr, PseudoCol, ReguVar, Tri};
pub use xasl::{
    AccessSpec, AggFunc, AggSpec, ConnectBySpec, DeleteSpec, FetchKind, FetchSpec, GroupBySpec,
    GroupOutCol, InsertSpec, InstnumMode, KeyRange, NodeStatus, OrderBySpec, ScanSourceSpec,
    SelUpdSpec, UpdateSpec, XaslKind, XaslNode, XaslPlan,
};
