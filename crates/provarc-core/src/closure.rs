//! # Closure Builder
//!
//! Computes the set of records an export must carry.
//!
//! Two stages:
//! 1. [`expand_node_selection`] grows the selected nodes along the provenance
//!    graph: all ancestors, then the direct outputs of calculation nodes.
//! 2. [`ClosureBuilder`] follows foreign keys outward from every captured
//!    record, one pass at a time, until a pass discovers nothing new.
//!
//! Both stages are worklists with visited sets; the record graph may be
//! cyclic.

use crate::primitives::{CALCULATION_TYPE_PREFIX, GROUP_TYPE, NODE_TYPE};
use crate::schema::FieldsInfo;
use crate::storage::{StoreTxn, TableSource};
use crate::types::{ProvarcError, Record};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

// =============================================================================
// SELECTION
// =============================================================================

/// The records a caller asked to export, by store id, grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    entries: BTreeMap<String, BTreeSet<u64>>,
}

impl Selection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one record.
    pub fn add(&mut self, entity_type: &str, id: u64) {
        self.entries
            .entry(entity_type.to_string())
            .or_default()
            .insert(id);
    }

    #[must_use]
    pub fn with(mut self, entity_type: &str, id: u64) -> Self {
        self.add(entity_type, id);
        self
    }

    /// Selected ids of one type.
    #[must_use]
    pub fn ids(&self, entity_type: &str) -> BTreeSet<u64> {
        self.entries.get(entity_type).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn nodes(&self) -> BTreeSet<u64> {
        self.ids(NODE_TYPE)
    }

    #[must_use]
    pub fn groups(&self) -> BTreeSet<u64> {
        self.ids(GROUP_TYPE)
    }

    /// Replace the selected ids of one type.
    pub fn set(&mut self, entity_type: &str, ids: BTreeSet<u64>) {
        self.entries.insert(entity_type.to_string(), ids);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeSet::is_empty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<u64>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Provenance expansion applied to the selected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionPolicy {
    /// Include every ancestor of a selected node.
    pub also_parents: bool,
    /// Include the direct outputs of selected calculation nodes.
    pub also_calc_outputs: bool,
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self {
            also_parents: true,
            also_calc_outputs: true,
        }
    }
}

/// Grow a node selection along incoming links and calculation outputs.
///
/// Ids that do not name a stored node are dropped.
pub fn expand_node_selection<T: TableSource>(
    txn: &StoreTxn<'_, T>,
    seeds: &BTreeSet<u64>,
    policy: ExpansionPolicy,
) -> Result<BTreeSet<u64>, ProvarcError> {
    let mut nodes = BTreeSet::new();
    for &id in seeds {
        if txn.get_record(NODE_TYPE, id)?.is_some() {
            nodes.insert(id);
        }
    }

    if policy.also_parents {
        let mut stack: Vec<u64> = nodes.iter().copied().collect();
        while let Some(node) = stack.pop() {
            for link in txn.input_links(node)? {
                if nodes.insert(link.input) {
                    stack.push(link.input);
                }
            }
        }
    }

    if policy.also_calc_outputs {
        let mut outputs = Vec::new();
        for &node in &nodes {
            let record = txn.require_record(NODE_TYPE, node)?;
            let is_calculation = record
                .text("node_type")
                .is_some_and(|t| t.starts_with(CALCULATION_TYPE_PREFIX));
            if is_calculation {
                outputs.extend(txn.output_links(node)?.into_iter().map(|l| l.output));
            }
        }
        nodes.extend(outputs);
    }

    debug!(seeds = seeds.len(), expanded = nodes.len(), "expanded node selection");
    Ok(nodes)
}

// =============================================================================
// CLOSURE
// =============================================================================

/// Records per type, keyed by store id.
pub type RecordsByType = BTreeMap<String, BTreeMap<u64, Record>>;

/// The dependency-complete set of records for one export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Closure {
    pub records: RecordsByType,
}

impl Closure {
    /// Captured records of one type.
    #[must_use]
    pub fn of_type(&self, entity_type: &str) -> Option<&BTreeMap<u64, Record>> {
        self.records.get(entity_type)
    }

    /// Captured nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (u64, &Record)> {
        self.records
            .get(NODE_TYPE)
            .into_iter()
            .flat_map(|m| m.iter().map(|(id, r)| (*id, r)))
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Fixed-point expansion of a selection along foreign keys.
///
/// Each pass loads the pending ids of every type, keeps the records not
/// captured before, and queues the targets of their foreign keys. A record
/// is returned by exactly one pass.
pub struct ClosureBuilder<'a, 's, T: TableSource> {
    txn: &'a StoreTxn<'s, T>,
    fields_info: &'a FieldsInfo,
    batch_size: usize,
    pending: BTreeMap<String, BTreeSet<u64>>,
    captured: RecordsByType,
    passes: usize,
}

impl<'a, 's, T: TableSource> ClosureBuilder<'a, 's, T> {
    /// Start from `selection`. Foreign keys are read from `fields_info`.
    pub fn new(
        txn: &'a StoreTxn<'s, T>,
        fields_info: &'a FieldsInfo,
        selection: &Selection,
        batch_size: usize,
    ) -> Self {
        let pending = selection
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(ty, ids)| (ty.to_string(), ids.clone()))
            .collect();
        Self {
            txn,
            fields_info,
            batch_size: batch_size.max(1),
            pending,
            captured: RecordsByType::new(),
            passes: 0,
        }
    }

    /// Run one pass. Returns the records first discovered in it, or `None`
    /// once the fixed point is reached.
    pub fn next_pass(&mut self) -> Result<Option<RecordsByType>, ProvarcError> {
        let pending = std::mem::take(&mut self.pending);
        let mut discovered = RecordsByType::new();

        for (entity_type, ids) in pending {
            let fields = self
                .fields_info
                .get(&entity_type)
                .ok_or_else(|| ProvarcError::UnknownEntityType(entity_type.clone()))?;
            let captured = self.captured.entry(entity_type.clone()).or_default();
            let fresh: Vec<u64> = ids
                .into_iter()
                .filter(|id| !captured.contains_key(id))
                .collect();

            let mut found = BTreeMap::new();
            for chunk in fresh.chunks(self.batch_size) {
                let records = self.txn.get_records(&entity_type, chunk)?;
                debug!(
                    entity_type = %entity_type,
                    requested = chunk.len(),
                    found = records.len(),
                    "loaded closure batch"
                );
                found.extend(records);
            }
            if found.is_empty() {
                continue;
            }

            for (field, info) in fields {
                let Some(target) = &info.requires else {
                    continue;
                };
                for record in found.values() {
                    if let Some(id) = record.reference(field) {
                        self.pending.entry(target.clone()).or_default().insert(id);
                    }
                }
            }

            captured.extend(found.iter().map(|(id, r)| (*id, r.clone())));
            discovered.insert(entity_type, found);
        }

        if discovered.is_empty() {
            return Ok(None);
        }
        self.passes += 1;
        Ok(Some(discovered))
    }

    /// Run passes until the fixed point and return every captured record.
    pub fn run(mut self) -> Result<Closure, ProvarcError> {
        while self.next_pass()?.is_some() {}
        self.captured.retain(|_, records| !records.is_empty());
        let closure = Closure {
            records: self.captured,
        };
        info!(
            passes = self.passes,
            records = closure.total(),
            "closure complete"
        );
        Ok(closure)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::primitives::{COMPUTER_TYPE, EXPORT_SEEDS, USER_TYPE};
    use crate::schema::describe_schema;
    use crate::storage::Store;
    use crate::types::LinkRow;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        store: Store,
        user: u64,
        computer: u64,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Store::open_standard(dir.path().join("db.redb")).unwrap();
        let (user, computer) = {
            let mut w = store.begin_write().unwrap();
            let user = w
                .insert_record(USER_TYPE, &Record::new().with("email", "a@b.c"))
                .unwrap();
            let computer = w
                .insert_record(
                    COMPUTER_TYPE,
                    &Record::new()
                        .with("uuid", "c0000000-0000-4000-8000-000000000000")
                        .with("name", "cluster"),
                )
                .unwrap();
            w.commit().unwrap();
            (user, computer)
        };
        Fixture {
            _dir: dir,
            store,
            user,
            computer,
        }
    }

    fn add_node(f: &Fixture, n: u8, node_type: &str, computer: bool) -> u64 {
        let mut w = f.store.begin_write().unwrap();
        let record = Record::new()
            .with("uuid", format!("{:02x}000000-0000-4000-8000-000000000000", n))
            .with("node_type", node_type)
            .with_ref("user", Some(f.user))
            .with_ref("dbcomputer", computer.then_some(f.computer));
        let id = w.insert_record(NODE_TYPE, &record).unwrap();
        w.commit().unwrap();
        id
    }

    fn link(f: &Fixture, input: u64, output: u64, label: &str) {
        let mut w = f.store.begin_write().unwrap();
        w.insert_link(&LinkRow::new(input, output, label)).unwrap();
        w.commit().unwrap();
    }

    #[test]
    fn ancestors_and_calc_outputs() {
        let f = fixture();
        let data_in = add_node(&f, 1, "data.int", false);
        let calc = add_node(&f, 2, "calculation.job", true);
        let result = add_node(&f, 3, "data.int", false);
        let unrelated = add_node(&f, 4, "data.int", false);
        link(&f, data_in, calc, "x");
        link(&f, calc, result, "result");

        let r = f.store.begin_read().unwrap();
        let seeds = BTreeSet::from([calc]);

        let both = expand_node_selection(&r, &seeds, ExpansionPolicy::default()).unwrap();
        assert_eq!(both, BTreeSet::from([data_in, calc, result]));

        let none = ExpansionPolicy {
            also_parents: false,
            also_calc_outputs: false,
        };
        assert_eq!(expand_node_selection(&r, &seeds, none).unwrap(), seeds);

        let from_result = expand_node_selection(&r, &BTreeSet::from([result, 999]), ExpansionPolicy {
            also_parents: true,
            also_calc_outputs: false,
        })
        .unwrap();
        assert_eq!(from_result, BTreeSet::from([data_in, calc, result]));
        assert!(!from_result.contains(&unrelated));
    }

    #[test]
    fn foreign_keys_reach_a_fixed_point() {
        let f = fixture();
        let calc = add_node(&f, 2, "calculation.job", true);
        let (info, _) = describe_schema(f.store.registry(), &EXPORT_SEEDS).unwrap();

        let r = f.store.begin_read().unwrap();
        let selection = Selection::new().with(NODE_TYPE, calc);
        let mut builder = ClosureBuilder::new(&r, &info, &selection, 1);

        let first = builder.next_pass().unwrap().unwrap();
        assert_eq!(first.keys().collect::<Vec<_>>(), vec![NODE_TYPE]);

        let second = builder.next_pass().unwrap().unwrap();
        assert_eq!(second[USER_TYPE].keys().copied().collect::<Vec<_>>(), vec![f.user]);
        assert_eq!(
            second[COMPUTER_TYPE].keys().copied().collect::<Vec<_>>(),
            vec![f.computer]
        );

        assert!(builder.next_pass().unwrap().is_none());
    }

    #[test]
    fn shared_dependencies_are_captured_once() {
        let f = fixture();
        let a = add_node(&f, 1, "data.int", false);
        let b = add_node(&f, 2, "data.int", false);
        let (info, _) = describe_schema(f.store.registry(), &EXPORT_SEEDS).unwrap();

        let r = f.store.begin_read().unwrap();
        let selection = Selection::new().with(NODE_TYPE, a).with(NODE_TYPE, b);
        let closure = ClosureBuilder::new(&r, &info, &selection, 999).run().unwrap();

        assert_eq!(closure.of_type(NODE_TYPE).unwrap().len(), 2);
        assert_eq!(closure.of_type(USER_TYPE).unwrap().len(), 1);
        assert!(closure.of_type(COMPUTER_TYPE).is_none());
        assert_eq!(closure.total(), 3);
    }

    #[test]
    fn empty_and_missing_selections_give_empty_closure() {
        let f = fixture();
        let (info, _) = describe_schema(f.store.registry(), &EXPORT_SEEDS).unwrap();
        let r = f.store.begin_read().unwrap();

        let closure = ClosureBuilder::new(&r, &info, &Selection::new(), 999).run().unwrap();
        assert!(closure.is_empty());

        let missing = Selection::new().with(NODE_TYPE, 4242);
        let closure = ClosureBuilder::new(&r, &info, &missing, 999).run().unwrap();
        assert!(closure.is_empty());
    }
}
