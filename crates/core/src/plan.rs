//! The access-path planner: choosing the cheapest index for a predicate
//! mask vector and composing per-filter choices into a join plan cost.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use quartzdb_primitives::ColId;

use crate::index::{ColumnSet, ConditionMask, Index, SortOrder};
use crate::session::Session;
use crate::table::Table;

/// The chosen access path for one filter, with the cost the index
/// reported. May carry a nested plan produced by the join enumerator;
/// the table layer only propagates it.
#[derive(Clone)]
pub struct PlanItem {
    pub index: Arc<dyn Index>,
    pub cost: f64,
    pub join_plan: Option<Box<PlanItem>>,
}

/// `USE INDEX (...)` style hints: when present, only the named indexes may
/// be chosen; the scan index stays available as the fallback.
#[derive(Debug, Clone, Default)]
pub struct IndexHints {
    allowed: HashSet<String>,
}

impl IndexHints {
    pub fn use_indexes(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.allowed.contains(name)
    }
}

/// Pick the cheapest index: the scan index is the baseline, every other
/// index competes with its masked cost, ties keep the earliest index in
/// the table's ordered index list.
pub fn best_plan_item(
    session: &Session,
    table: &dyn Table,
    masks: Option<&[ConditionMask]>,
    hints: Option<&IndexHints>,
    sort_order: Option<&SortOrder>,
    all_columns: Option<&ColumnSet>,
) -> PlanItem {
    // A view's access path is the materialized index keyed by these
    // masks; there is nothing else to compete with.
    if let Some(view) = table.as_view() {
        if let Ok(index) = view.index_for(session, masks) {
            return PlanItem {
                cost: index.cost(session, masks, sort_order, all_columns),
                index,
                join_plan: None,
            };
        }
    }
    let indexes = table.indexes();
    debug_assert!(!indexes.is_empty(), "a table always has its scan index");
    let scan = indexes[0].clone();
    let mut best = PlanItem {
        cost: scan.cost(session, None, None, None),
        index: scan,
        join_plan: None,
    };
    for index in indexes.iter().skip(1) {
        if let Some(hints) = hints {
            if !hints.allows(index.name()) {
                continue;
            }
        }
        let cost = index.cost(session, masks, sort_order, all_columns);
        if cost < best.cost {
            best = PlanItem {
                index: index.clone(),
                cost,
                join_plan: None,
            };
        }
    }
    best
}

/// One predicate on a filter's table, in index-condition form.
#[derive(Debug, Clone)]
pub struct Condition {
    pub col: ColId,
    pub mask: ConditionMask,
    /// Filters whose rows must be available before this predicate can be
    /// evaluated (the other side of a join condition).
    pub depends_on: Vec<usize>,
}

/// One table occurrence in a query plan.
pub struct TableFilter {
    pub table: Arc<dyn Table>,
    pub hints: Option<IndexHints>,
    conditions: RwLock<Vec<Condition>>,
    evaluatable: RwLock<bool>,
}

impl TableFilter {
    pub fn new(table: Arc<dyn Table>) -> Self {
        Self {
            table,
            hints: None,
            conditions: RwLock::new(Vec::new()),
            evaluatable: RwLock::new(false),
        }
    }

    pub fn with_hints(mut self, hints: IndexHints) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn add_condition(&self, condition: Condition) {
        self.conditions.write().push(condition);
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.conditions.read().clone()
    }

    pub fn set_evaluatable(&self, evaluatable: bool) {
        *self.evaluatable.write() = evaluatable;
    }

    pub fn is_evaluatable(&self) -> bool {
        *self.evaluatable.read()
    }

    /// The per-column mask vector built from the conditions whose
    /// dependencies are all evaluatable.
    fn masks(&self, evaluatable: &[bool]) -> Vec<ConditionMask> {
        let n = self.table.base().column_count();
        let mut masks = vec![ConditionMask::empty(); n];
        for c in self.conditions.read().iter() {
            if c.depends_on.iter().all(|&f| evaluatable[f]) {
                if let Some(slot) = masks.get_mut(c.col.idx()) {
                    *slot |= c.mask;
                }
            }
        }
        masks
    }

    pub fn best_plan_item(
        &self,
        session: &Session,
        evaluatable: &[bool],
        sort_order: Option<&SortOrder>,
    ) -> PlanItem {
        let masks = self.masks(evaluatable);
        best_plan_item(
            session,
            self.table.as_ref(),
            Some(&masks),
            self.hints.as_ref(),
            sort_order,
            None,
        )
    }
}

/// A candidate join order over a set of filters.
pub struct Plan {
    pub filters: Vec<Arc<TableFilter>>,
}

impl Plan {
    pub fn new(filters: Vec<Arc<TableFilter>>) -> Self {
        Self { filters }
    }

    /// Cost of evaluating the filters in `order`: each filter's item cost
    /// folds in multiplicatively. A join condition that cannot become
    /// evaluatable under this ordering makes the plan infeasible.
    ///
    /// The filters' evaluatable flags are restored afterwards, so cost
    /// estimation never leaks state into the chosen plan.
    pub fn calculate_cost(&self, session: &Session, order: &[usize]) -> f64 {
        let saved: Vec<bool> = self.filters.iter().map(|f| f.is_evaluatable()).collect();
        let mut evaluatable = vec![false; self.filters.len()];
        let mut cost = 1.0;
        'walk: for &fi in order {
            evaluatable[fi] = true;
            let filter = &self.filters[fi];
            filter.set_evaluatable(true);
            for c in filter.conditions().iter() {
                if !c.depends_on.iter().all(|&dep| evaluatable[dep]) {
                    cost = f64::INFINITY;
                    break 'walk;
                }
            }
            let item = filter.best_plan_item(session, &evaluatable, None);
            cost *= 1.0 + item.cost;
        }
        for (filter, was) in self.filters.iter().zip(saved) {
            filter.set_evaluatable(was);
        }
        cost
    }

    /// After the final ordering is chosen, drop the index conditions that
    /// can never feed an index lookup under it. The last filter keeps all
    /// of its conditions: its single-pass evaluation needs no further
    /// optimization.
    pub fn remove_unusable_index_conditions(&self, order: &[usize]) {
        let mut evaluatable = vec![false; self.filters.len()];
        for (pos, &fi) in order.iter().enumerate() {
            evaluatable[fi] = true;
            if pos == order.len() - 1 {
                break;
            }
            self.filters[fi]
                .conditions
                .write()
                .retain(|c| c.depends_on.iter().all(|&dep| evaluatable[dep]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexType;
    use crate::table::tests_support::{self, table_session};
    use quartzdb_value::Value;

    #[test]
    fn scan_index_is_the_baseline() {
        let (session, table) = table_session();
        let item = best_plan_item(&session, table.as_ref(), None, None, None, None);
        assert!(item.index.index_type().contains(IndexType::SCAN));
    }

    #[test]
    fn equality_mask_picks_the_secondary_index() {
        let (session, table) = table_session();
        for i in 0..100 {
            let row = table
                .convert_insert_row(&session, vec![Some(Value::from(i)), None], None)
                .unwrap();
            table.add_row(&session, row).unwrap();
        }
        let mut masks = vec![ConditionMask::empty(); 2];
        masks[0] = ConditionMask::EQUALITY;
        let item = best_plan_item(&session, table.as_ref(), Some(&masks), None, None, None);
        assert_eq!(item.index.name(), "IDX_A");
    }

    #[test]
    fn ties_keep_first_seen_and_hints_exclude() {
        let (session, table) = table_session();
        // Two identical single-column indexes on A report equal costs.
        tests_support::add_btree_index(&session, &table, "IDX_A2", &[0], false).unwrap();
        let mut masks = vec![ConditionMask::empty(); 2];
        masks[0] = ConditionMask::EQUALITY;
        let item = best_plan_item(&session, table.as_ref(), Some(&masks), None, None, None);
        assert_eq!(item.index.name(), "IDX_A");

        let hints = IndexHints::use_indexes(["IDX_A2"]);
        let item =
            best_plan_item(&session, table.as_ref(), Some(&masks), Some(&hints), None, None);
        assert_eq!(item.index.name(), "IDX_A2");
    }

    #[test]
    fn infeasible_order_costs_infinity() {
        let (session, table) = table_session();
        let f0 = Arc::new(TableFilter::new(table.clone()));
        let f1 = Arc::new(TableFilter::new(table.clone()));
        // Filter 0's join condition needs filter 1's row.
        f0.add_condition(Condition {
            col: quartzdb_primitives::ColId(0),
            mask: ConditionMask::EQUALITY,
            depends_on: vec![1],
        });
        let plan = Plan::new(vec![f0, f1]);
        assert_eq!(plan.calculate_cost(&session, &[0, 1]), f64::INFINITY);
        assert!(plan.calculate_cost(&session, &[1, 0]).is_finite());
        // Cost estimation restored the evaluatable flags.
        assert!(plan.filters.iter().all(|f| !f.is_evaluatable()));
    }
}
