// # List Files
//
// A list file is a sequential, appendable, scan-restartable container of
// homogeneously typed tuples owned by a query. Tuples live on fixed-size
// temporary pages and are addressed by (vpid, offset); oversized tuples
// spill to an overflow chain. Appends are serialized by the list-file
// mutex, which also guards the page directory; each scan carries its own
// private position and is frozen against appends made after it starts.

use crate::common::{QueryId, TupleAddress, Vpid};
use crate::error::{DbError, Result};
use crate::runtime::tuple::{self, TypeList};
use crate::runtime::value::{Domain, Value};
use parking_lot::Mutex;
use std::sync::Arc;

/// Size of one temporary list page
pub const LIST_PAGE_SIZE: usize = 4096;

/// Record header: payload length (u32) + record kind (u8)
const RECORD_HEADER_SIZE: usize = 5;

const KIND_INLINE: u8 = 0;
const KIND_OVERFLOW: u8 = 1;

/// Which set operation produced this list, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    Difference,
    Intersect,
}

/// Flags recorded on a list file
#[derive(Debug, Clone, Copy, Default)]
pub struct ListFlags {
    /// Duplicate elimination required before the list is final
    pub distinct: bool,
    /// This list is the query's final result
    pub final_result: bool,
    /// Output of a set operation
    pub set_op: Option<SetOpKind>,
}

struct ListInner {
    pages: Vec<Vec<u8>>,
    /// Page-descriptor cache: address of every tuple in append order
    directory: Vec<TupleAddress>,
    /// Overflow chains for tuples larger than a page
    overflow: Vec<Vec<u8>>,
    closed: bool,
}

/// An appendable tuple container backed by temporary pages
pub struct ListFile {
    query_id: QueryId,
    type_list: TypeList,
    flags: ListFlags,
    inner: Mutex<ListInner>,
}

impl ListFile {
    pub fn new(query_id: QueryId, type_list: TypeList, flags: ListFlags) -> Self {
        Self {
            query_id,
            type_list,
            flags,
            inner: Mutex::new(ListInner {
                pages: Vec::new(),
                directory: Vec::new(),
                overflow: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn type_list(&self) -> &TypeList {
        &self.type_list
    }

    pub fn flags(&self) -> ListFlags {
        self.flags
    }

    pub fn tuple_count(&self) -> usize {
        self.inner.lock().directory.len()
    }

    /// Append a tuple, encoding it against the list's type list.
    pub fn append_values(&self, values: &[Value]) -> Result<TupleAddress> {
        let bytes = tuple::encode_tuple(values, &self.type_list)?;
        self.append_encoded(bytes)
    }

    /// Append an already-encoded tuple. Fast path writes inline into the
    /// current page; a tuple that cannot fit any page goes to an overflow
    /// chain addressed through a fixed-size inline stub.
    pub fn append_encoded(&self, bytes: Vec<u8>) -> Result<TupleAddress> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::InvalidState(format!(
                "list file of query {} is closed",
                self.query_id
            )));
        }

        let record_len = RECORD_HEADER_SIZE + bytes.len();
        if record_len > LIST_PAGE_SIZE {
            // Overflow: the page record carries the chain index
            let chain = inner.overflow.len() as u32;
            inner.overflow.push(bytes);
            let addr = push_record(&mut inner, KIND_OVERFLOW, &chain.to_be_bytes());
            inner.directory.push(addr);
            return Ok(addr);
        }

        let addr = push_record(&mut inner, KIND_INLINE, &bytes);
        inner.directory.push(addr);
        Ok(addr)
    }

    /// Address of the i-th tuple in append order
    pub fn address_of(&self, index: usize) -> Option<TupleAddress> {
        self.inner.lock().directory.get(index).copied()
    }

    /// Decode the tuple at a saved address
    pub fn read_at(&self, addr: TupleAddress) -> Result<Vec<Value>> {
        let inner = self.inner.lock();
        let bytes = record_payload(&inner, addr)?;
        tuple::decode_tuple(&bytes, &self.type_list)
    }

    /// Decode the i-th tuple in append order
    pub fn read_index(&self, index: usize) -> Result<Vec<Value>> {
        let addr = self.address_of(index).ok_or_else(|| {
            DbError::Execution(format!("list file has no tuple {}", index))
        })?;
        self.read_at(addr)
    }

    /// Rewrite one fixed-width column of a stored tuple in place.
    pub fn rewrite_fixed(
        &self,
        index: usize,
        column: usize,
        value: &Value,
        domain: &Domain,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let addr = *inner.directory.get(index).ok_or_else(|| {
            DbError::Execution(format!("list file has no tuple {}", index))
        })?;
        let (kind, page, start, len) = locate_record(&inner, addr)?;
        match kind {
            KIND_INLINE => {
                let bytes = &mut inner.pages[page][start..start + len];
                tuple::tuple_set_value(bytes, column, value, domain)
            }
            KIND_OVERFLOW => {
                let chain = chain_index(&inner.pages[page][start..start + len])?;
                let bytes = &mut inner.overflow[chain];
                tuple::tuple_set_value(bytes, column, value, domain)
            }
            other => Err(DbError::Internal(format!("bad record kind {}", other))),
        }
    }

    /// Open a sequential scan. The scan sees the tuples present now; later
    /// appends are not visible to it.
    pub fn open_scan(self: &Arc<Self>) -> ListScan {
        ListScan {
            list: Arc::clone(self),
            next_index: 0,
            frozen_count: self.tuple_count(),
        }
    }

    /// Drop all contents, keeping the type list. Used when a correlated
    /// subquery's result must be recomputed.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.directory.clear();
        inner.overflow.clear();
        inner.closed = false;
    }

    /// Close the list to further appends
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

fn push_record(inner: &mut ListInner, kind: u8, payload: &[u8]) -> TupleAddress {
    let record_len = RECORD_HEADER_SIZE + payload.len();
    let need_new_page = match inner.pages.last() {
        Some(page) => page.len() + record_len > LIST_PAGE_SIZE,
        None => true,
    };
    if need_new_page {
        inner.pages.push(Vec::with_capacity(LIST_PAGE_SIZE));
    }
    let page_idx = inner.pages.len() - 1;
    let page = &mut inner.pages[page_idx];
    let offset = page.len() as u32;
    page.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    page.push(kind);
    page.extend_from_slice(payload);
    TupleAddress {
        vpid: Vpid::new(0, page_idx as u32),
        offset,
    }
}

fn locate_record(inner: &ListInner, addr: TupleAddress) -> Result<(u8, usize, usize, usize)> {
    let page_idx = addr.vpid.pageid as usize;
    let page = inner.pages.get(page_idx).ok_or_else(|| {
        DbError::Execution(format!("no list page {}", page_idx))
    })?;
    let offset = addr.offset as usize;
    if offset + RECORD_HEADER_SIZE > page.len() {
        return Err(DbError::Execution("corrupt tuple record header".to_string()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&page[offset..offset + 4]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    let kind = page[offset + 4];
    let start = offset + RECORD_HEADER_SIZE;
    if start + len > page.len() {
        return Err(DbError::Execution("corrupt tuple record payload".to_string()));
    }
    Ok((kind, page_idx, start, len))
}

fn record_payload(inner: &ListInner, addr: TupleAddress) -> Result<Vec<u8>> {
    let (kind, page, start, len) = locate_record(inner, addr)?;
    match kind {
        KIND_INLINE => Ok(inner.pages[page][start..start + len].to_vec()),
        KIND_OVERFLOW => {
            let chain = chain_index(&inner.pages[page][start..start + len])?;
            inner
                .overflow
                .get(chain)
                .cloned()
                .ok_or_else(|| DbError::Execution("dangling overflow chain".to_string()))
        }
        other => Err(DbError::Internal(format!("bad record kind {}", other))),
    }
}

fn chain_index(payload: &[u8]) -> Result<usize> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| DbError::Execution("bad overflow stub".to_string()))?;
    Ok(u32::from_be_bytes(bytes) as usize)
}

/// Saved scan position for positional jumps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListScanPos {
    pub index: usize,
}

/// A private cursor over a list file
pub struct ListScan {
    list: Arc<ListFile>,
    next_index: usize,
    frozen_count: usize,
}

impl ListScan {
    /// Next tuple in append order, or `None` at the frozen end
    pub fn next_tuple(&mut self) -> Result<Option<Vec<Value>>> {
        if self.next_index >= self.frozen_count {
            return Ok(None);
        }
        let values = self.list.read_index(self.next_index)?;
        self.next_index += 1;
        Ok(Some(values))
    }

    /// Position of the tuple `next_tuple` would return next
    pub fn position(&self) -> ListScanPos {
        ListScanPos { index: self.next_index }
    }

    /// Jump back (or forward) to a saved position
    pub fn jump_to(&mut self, pos: ListScanPos) {
        self.next_index = pos.index.min(self.frozen_count);
    }

    pub fn list(&self) -> &Arc<ListFile> {
        &self.list
    }
}
