//! ExprFilter: which tasks an event starts and which it rules out.

use crate::domain::TaskConfig;

use super::expr::{Expr, ExprError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterResult {
    /// Predicate keyed on the event and true: start these.
    pub matched: Vec<String>,
    /// Keyed on the event but false: cancel these.
    pub not_matched: Vec<String>,
}

impl FilterResult {
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty() && self.not_matched.is_empty()
    }
}

/// Parsed predicates of one job, in task order.
#[derive(Debug, Clone)]
pub struct ExprFilter {
    entries: Vec<(String, Expr)>,
}

impl ExprFilter {
    pub fn new(tasks: &[TaskConfig]) -> Result<Self, ExprError> {
        let entries = tasks
            .iter()
            .map(|t| Ok((t.name.clone(), Expr::parse(&t.when)?)))
            .collect::<Result<Vec<_>, ExprError>>()?;
        Ok(Self { entries })
    }

    pub fn expr(&self, task: &str) -> Option<&Expr> {
        self.entries
            .iter()
            .find(|(name, _)| name == task)
            .map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e))
    }

    /// Split the `candidates` whose predicate is keyed on `key`.
    pub fn filter(&self, key: &str, state: &str, candidates: impl Fn(&str) -> bool) -> FilterResult {
        let mut result = FilterResult::default();
        for (name, expr) in &self.entries {
            if !candidates(name) {
                continue;
            }
            match expr.eval(key, state) {
                Some(true) => result.matched.push(name.clone()),
                Some(false) => result.not_matched.push(name.clone()),
                None => {}
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks() -> Vec<TaskConfig> {
        vec![
            TaskConfig::command("a", "true"),
            TaskConfig::command("b", "true").when("a==DONE"),
            TaskConfig::command("c", "true").when("a==ERROR"),
            TaskConfig::command("d", "true").when("b"),
        ]
    }

    #[test]
    fn start_event_picks_root_tasks() {
        let f = ExprFilter::new(&tasks()).unwrap();
        let r = f.filter("JOB", "START", |_| true);
        assert_eq!(r.matched, vec!["a"]);
        assert!(r.not_matched.is_empty());
    }

    #[test]
    fn splits_dependants_of_a_task() {
        let f = ExprFilter::new(&tasks()).unwrap();
        let r = f.filter("a", "ERROR", |_| true);
        assert_eq!(r.matched, vec!["c"]);
        assert_eq!(r.not_matched, vec!["b"]);
    }

    #[test]
    fn leaf_has_no_related_tasks() {
        let f = ExprFilter::new(&tasks()).unwrap();
        assert!(f.filter("d", "DONE", |_| true).is_empty());
    }

    #[test]
    fn candidates_restrict_the_scan() {
        let f = ExprFilter::new(&tasks()).unwrap();
        let r = f.filter("a", "DONE", |n| n != "b");
        assert!(r.matched.is_empty());
        assert_eq!(r.not_matched, vec!["c"]);
    }
}
