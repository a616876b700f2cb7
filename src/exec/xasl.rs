// # Plan Trees
//
// The interpreter's input: a tree of procedure nodes with enumerated child
// lists. `aptr_list` holds uncorrelated precomputed inputs, `bptr_list` and
// `fptr_list` path-expression fetches, `dptr_list` correlated subqueries
// re-run per outer tuple, `scan_ptr` the nested-loop spine, and
// `connect_by` the hierarchy builder. The tree is owned top-down and fully
// serializable; the plan cache stores the encoded stream and hands out
// decoded clones.

use crate::common::{NodeId, Oid};
use crate::error::Result;
use crate::exec::regu::{PredExpr, ReguVar};
use crate::runtime::merge_join::JoinType;
use crate::runtime::sort::SortKey;
use crate::runtime::value::Domain;
use serde::{Deserialize, Serialize};

/// Runtime status of a node during one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Cleared,
    Running,
    Success,
    Failure,
}

/// How the instance-number predicate behaves across the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum InstnumMode {
    /// Non-monotonic predicate: evaluate every row
    Continue,
    /// A false predicate means no further row can qualify
    Stop,
    /// Once a row qualified, the first false row ends the contiguous range
    Check,
}

/// One source scan within a node
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AccessSpec {
    pub source: ScanSourceSpec,
    /// Re-evaluated for every tuple the driver produces
    pub where_pred: Option<PredExpr>,
    /// Slots the scan binds, one per source column
    pub bind_slots: Vec<usize>,
    /// Slot receiving the produced row's oid, for sources that have one
    pub oid_slot: Option<usize>,
    /// Pin pages across calls; disabled when the node updates the scanned
    /// class or takes composite locks
    pub fixed: bool,
    /// Batch qualification per block
    pub grouped: bool,
    /// Produce index results in OID order
    pub iscan_oid_order: bool,
    /// Known empty at open time; skipped entirely
    pub known_empty: bool,
}

impl AccessSpec {
    pub fn heap(class_oid: Oid, node_id: NodeId, bind_slots: Vec<usize>) -> Self {
        Self {
            source: ScanSourceSpec::Heap { class_oid, node_id },
            where_pred: None,
            bind_slots,
            oid_slot: None,
            fixed: true,
            grouped: false,
            iscan_oid_order: false,
            known_empty: false,
        }
    }

    pub fn list(aptr_index: usize, bind_slots: Vec<usize>) -> Self {
        Self {
            source: ScanSourceSpec::List { aptr_index },
            where_pred: None,
            bind_slots,
            oid_slot: None,
            fixed: false,
            grouped: false,
            iscan_oid_order: false,
            known_empty: false,
        }
    }

    pub fn with_oid_slot(mut self, slot: usize) -> Self {
        self.oid_slot = Some(slot);
        self
    }
}

/// Index key range; `constant` records whether both bounds are
/// compile-time constants.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct KeyRange {
    pub low: Option<ReguVar>,
    pub high: Option<ReguVar>,
}

impl KeyRange {
    pub fn is_constant(&self) -> bool {
        self.low.as_ref().map(|r| r.is_constant()).unwrap_or(true)
            && self.high.as_ref().map(|r| r.is_constant()).unwrap_or(true)
    }
}

/// The six scan source kinds
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum ScanSourceSpec {
    /// Heap-sequential over a class; a non-local node id rewrites the scan
    /// to stream through the connection layer into a local list file
    Heap { class_oid: Oid, node_id: NodeId },
    /// Index scan with key ranges
    Index {
        index_name: String,
        class_oid: Oid,
        ranges: Vec<KeyRange>,
    },
    /// One row per attribute of a class
    ClassAttr { class_oid: Oid },
    /// Scan of a sibling plan's output list
    List { aptr_index: usize },
    /// Elements of a collection value
    Set { source: ReguVar },
    /// Method invocation over an input list
    Method {
        aptr_index: usize,
        method_name: String,
    },
}

/// ObjFetch / SetFetch procedures in `bptr_list` and `fptr_list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum FetchKind {
    Object,
    Set,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct FetchSpec {
    pub kind: FetchKind,
    /// Yields the OID (Object) or the collection (Set)
    pub source: ReguVar,
    /// Owning class for object fetches
    pub class_oid: Oid,
    /// (attribute position, slot) bindings for Object; (element position,
    /// slot) for Set
    pub binds: Vec<(u32, usize)>,
    /// Evaluated after binding; anything but TRUE disqualifies the row
    pub selector: Option<PredExpr>,
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum AggFunc {
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AggSpec {
    pub func: AggFunc,
    pub operand: Option<ReguVar>,
    pub distinct: bool,
}

/// Group-by over the node's materialized input list. Key and operand regu
/// variables address the input list's columns through `Slot(column)`.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GroupBySpec {
    /// Input-list columns forming the group key, outermost first
    pub key_cols: Vec<usize>,
    pub aggs: Vec<AggSpec>,
    /// Over a synthesized row of [keys..., aggregates...]
    pub having: Option<PredExpr>,
    pub groupbynum_pred: Option<PredExpr>,
    pub with_rollup: bool,
    /// Output columns: key positions or aggregate references
    pub out_cols: Vec<GroupOutCol>,
    pub out_types: Vec<Domain>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum GroupOutCol {
    /// i-th group key
    Key(usize),
    /// i-th aggregate
    Agg(usize),
    GroupbyNum,
}

/// Order-by / distinct pass over the node's output list
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct OrderBySpec {
    pub keys: Vec<SortKey>,
    pub ordbynum_pred: Option<PredExpr>,
    /// Positional projection applied while sorting
    pub out_cols: Option<Vec<usize>>,
    pub distinct: bool,
    /// The plan's existing order already covers this; skip the sort
    pub already_ordered: bool,
}

/// Hierarchical expansion attached to a build node
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ConnectBySpec {
    /// Selects the initial frontier from the input
    pub start_with: Option<PredExpr>,
    /// Parent-child predicate; PRIOR reads resolve against the prior list
    pub connect_by: Option<PredExpr>,
    pub nocycle: bool,
    /// Sibling ordering applied before sibling indices are assigned
    pub order_siblings_by: Vec<SortKey>,
    /// Output columns compared during the ancestor walk (pseudo-columns
    /// excluded); empty means every user column
    pub cycle_cols: Vec<usize>,
}

/// DML procedure payloads. The `aptr` source yields the rows to touch.
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UpdateSpec {
    pub class_oid: Oid,
    /// Attribute positions receiving new values; the source rows are
    /// (instance oid, class oid, new values...)
    pub attr_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct DeleteSpec {
    pub class_oid: Oid,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct InsertSpec {
    pub class_oid: Oid,
    /// INSERT ... VALUES: a single tuple of expressions; otherwise the
    /// first aptr child is the SELECT source
    pub values: Option<Vec<ReguVar>>,
    pub replace: bool,
    /// ON DUPLICATE KEY UPDATE: the dependent update plan plus the
    /// reserved slot its source reads the duplicate's oid from
    pub on_dup_update: Option<Box<XaslNode>>,
    pub dup_oid_slot: Option<usize>,
    pub not_null_attrs: Vec<u32>,
}

/// SELECT ... FOR UPDATE side-effect: atomic increment of one attribute of
/// the selected row
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct SelUpdSpec {
    pub class_oid: Oid,
    /// Slot holding the target row's oid
    pub oid_slot: usize,
    pub attr_id: u32,
    /// +1 or -1
    pub delta: i64,
}

/// Node kinds
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum XaslKind {
    BuildList,
    BuildValue { aggs: Vec<AggSpec> },
    Union { left: usize, right: usize },
    Difference { left: usize, right: usize },
    Intersect { left: usize, right: usize },
    MergeList {
        left: usize,
        right: usize,
        keys: Vec<(usize, usize)>,
        join: JoinType,
    },
    /// Hierarchy builder, reached through a build node's `connect_by`
    ConnectBy,
    /// Nested-loop spine node: emits through its parent
    Scan,
    Update(UpdateSpec),
    Delete(DeleteSpec),
    Insert(InsertSpec),
    /// Evaluate expressions once, no result list
    Do { exprs: Vec<ReguVar> },
    ObjFetch(FetchSpec),
    SetFetch(FetchSpec),
}

/// One plan-tree node
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct XaslNode {
    /// Stable id within the plan, used to key runtime state
    pub id: usize,
    pub kind: XaslKind,
    pub spec_list: Vec<AccessSpec>,
    pub after_join_pred: Option<PredExpr>,
    pub if_pred: Option<PredExpr>,
    pub instnum_pred: Option<PredExpr>,
    pub instnum_mode: InstnumMode,
    /// Result columns; with composite locking the first two carry
    /// (instance oid, class oid)
    pub outptr_list: Vec<ReguVar>,
    pub out_types: Vec<Domain>,
    pub aptr_list: Vec<XaslNode>,
    pub bptr_list: Vec<FetchSpec>,
    pub dptr_list: Vec<XaslNode>,
    pub fptr_list: Vec<FetchSpec>,
    pub scan_ptr: Option<Box<XaslNode>>,
    pub connect_by: Option<Box<ConnectBySpec>>,
    pub group_by: Option<GroupBySpec>,
    pub order_by: Option<OrderBySpec>,
    pub selupd_list: Vec<SelUpdSpec>,
    pub composite_locking: bool,
    /// This node is the inner spine of an outer nested-loop join; its
    /// scans must not batch qualification
    pub outer_join_inner: bool,
    pub distinct: bool,
    pub is_final: bool,
}

impl XaslNode {
    pub fn new(id: usize, kind: XaslKind) -> Self {
        Self {
            id,
            kind,
            spec_list: Vec::new(),
            after_join_pred: None,
            if_pred: None,
            instnum_pred: None,
            instnum_mode: InstnumMode::Continue,
            outptr_list: Vec::new(),
            out_types: Vec::new(),
            aptr_list: Vec::new(),
            bptr_list: Vec::new(),
            dptr_list: Vec::new(),
            fptr_list: Vec::new(),
            scan_ptr: None,
            connect_by: None,
            group_by: None,
            order_by: None,
            selupd_list: Vec::new(),
            composite_locking: false,
            outer_join_inner: false,
            distinct: false,
            is_final: false,
        }
    }

    /// Ids of this node and every reachable subordinate
    pub fn collect_ids(&self, out: &mut Vec<usize>) {
        out.push(self.id);
        for child in self
            .aptr_list
            .iter()
            .chain(self.dptr_list.iter())
        {
            child.collect_ids(out);
        }
        if let Some(scan) = &self.scan_ptr {
            scan.collect_ids(out);
        }
        if let XaslKind::Insert(spec) = &self.kind {
            if let Some(dep) = &spec.on_dup_update {
                dep.collect_ids(out);
            }
        }
    }
}

/// A complete plan: the root node plus the value-list arena size
#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct XaslPlan {
    pub root: XaslNode,
    /// Size of the per-execution value-list arena
    pub slot_count: usize,
    /// Reserved slots bound from caller parameters
    pub param_slots: Vec<usize>,
}

impl XaslPlan {
    pub fn new(root: XaslNode, slot_count: usize) -> Self {
        Self { root, slot_count, param_slots: Vec::new() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (plan, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::regu::{constant, slot};
    use crate::runtime::value::Value;

    #[test]
    fn test_plan_stream_round_trip() {
        let mut node = XaslNode::new(0, XaslKind::BuildList);
        node.spec_list
            .push(AccessSpec::heap(Oid::new(0, 1, 0), 0, vec![0, 1]));
        node.outptr_list = vec![slot(0), slot(1)];
        node.out_types = vec![Domain::int(), Domain::string()];
        node.if_pred = Some(crate::exec::regu::cmp(
            crate::exec::regu::CmpOp::Gt,
            slot(0),
            constant(Value::Int(10)),
        ));
        let plan = XaslPlan::new(node, 2);

        let bytes = plan.encode().unwrap();
        let decoded = XaslPlan::decode(&bytes).unwrap();
        assert_eq!(decoded.slot_count, 2);
        assert_eq!(decoded.root.outptr_list.len(), 2);
        assert!(matches!(decoded.root.kind, XaslKind::BuildList));
    }

    #[test]
    fn test_collect_ids_covers_subplans() {
        let mut root = XaslNode::new(0, XaslKind::BuildList);
        root.aptr_list.push(XaslNode::new(1, XaslKind::BuildList));
        root.dptr_list.push(XaslNode::new(2, XaslKind::BuildValue { aggs: vec![] }));
        root.scan_ptr = Some(Box::new(XaslNode::new(3, XaslKind::Scan)));
        let mut ids = Vec::new();
        root.collect_ids(&mut ids);
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_key_range_constant_detection() {
        let constant_range = KeyRange {
            low: Some(constant(Value::Int(1))),
            high: Some(constant(Value::Int(9))),
        };
        assert!(constant_range.is_constant());
        let correlated = KeyRange { low: Some(slot(3)), high: None };
        assert!(!correlated.is_constant());
    }
}
