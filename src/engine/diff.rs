//! Pure diff and classification of desired vs. observed entity sets
//!
//! No I/O here: both employer and employee classification are functions of
//! the two status lists alone, keyed by stable identity. The executor turns
//! the classification into mutations.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

use super::adapter::{EmployeeStatus, EmployerStatus};

/// Disjoint partition of the employee sets.
///
/// `to_update` carries the expected snapshot (the state to write), not the
/// observed one.
#[derive(Clone, Debug)]
pub struct EmployeeClassification<X> {
    pub to_create: Vec<EmployeeStatus<X>>,
    pub to_update: Vec<EmployeeStatus<X>>,
    pub to_delete: Vec<EmployeeStatus<X>>,
    pub unchanged: Vec<EmployeeStatus<X>>,
}

impl<X> Default for EmployeeClassification<X> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<X> EmployeeClassification<X> {
    /// Nothing to do: the observed set already matches the desired set.
    pub fn is_converged(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Partition expected vs. current employees by identity and status equality.
///
/// Duplicate ids within either input are an adapter contract violation.
pub fn diff_employees<X>(
    expected: &[EmployeeStatus<X>],
    current: &[EmployeeStatus<X>],
) -> Result<EmployeeClassification<X>>
where
    X: Clone + PartialEq,
{
    let expected_by_id = index_employees(expected, "expected")?;
    let current_by_id = index_employees(current, "current")?;

    let mut classification = EmployeeClassification::default();

    for (id, exp) in &expected_by_id {
        match current_by_id.get(id) {
            None => classification.to_create.push((*exp).clone()),
            Some(cur) if !exp.matches(cur) => classification.to_update.push((*exp).clone()),
            Some(_) => classification.unchanged.push((*exp).clone()),
        }
    }

    for (id, cur) in &current_by_id {
        if !expected_by_id.contains_key(id) {
            classification.to_delete.push((*cur).clone());
        }
    }

    Ok(classification)
}

fn index_employees<'a, X>(
    statuses: &'a [EmployeeStatus<X>],
    side: &str,
) -> Result<BTreeMap<&'a str, &'a EmployeeStatus<X>>> {
    let mut by_id = BTreeMap::new();
    for status in statuses {
        if by_id.insert(status.employee_id.as_str(), status).is_some() {
            return Err(Error::AdapterContract(format!(
                "duplicate employee id {:?} in {} set",
                status.employee_id, side
            )));
        }
    }
    Ok(by_id)
}

/// Same partition for the employer-side status list.
#[derive(Clone, Debug)]
pub struct EmployerClassification<Y> {
    pub to_create: Vec<EmployerStatus<Y>>,
    pub to_update: Vec<EmployerStatus<Y>>,
    pub to_delete: Vec<EmployerStatus<Y>>,
    pub unchanged: Vec<EmployerStatus<Y>>,
}

impl<Y> Default for EmployerClassification<Y> {
    fn default() -> Self {
        Self {
            to_create: Vec::new(),
            to_update: Vec::new(),
            to_delete: Vec::new(),
            unchanged: Vec::new(),
        }
    }
}

impl<Y> EmployerClassification<Y> {
    pub fn is_converged(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

pub fn diff_employers<Y>(
    expected: &[EmployerStatus<Y>],
    current: &[EmployerStatus<Y>],
) -> Result<EmployerClassification<Y>>
where
    Y: Clone + PartialEq,
{
    let mut expected_by_id = BTreeMap::new();
    for status in expected {
        if expected_by_id
            .insert(status.employer_id.as_str(), status)
            .is_some()
        {
            return Err(Error::AdapterContract(format!(
                "duplicate employer status id {:?}",
                status.employer_id
            )));
        }
    }
    let mut current_by_id = BTreeMap::new();
    for status in current {
        current_by_id.insert(status.employer_id.as_str(), status);
    }

    let mut classification = EmployerClassification::default();
    for (id, exp) in &expected_by_id {
        match current_by_id.get(id) {
            None => classification.to_create.push((*exp).clone()),
            Some(cur) if exp.extra != cur.extra => classification.to_update.push((*exp).clone()),
            Some(_) => classification.unchanged.push((*exp).clone()),
        }
    }
    for (id, cur) in &current_by_id {
        if !expected_by_id.contains_key(id) {
            classification.to_delete.push((*cur).clone());
        }
    }
    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee(id: &str, ready: bool, extra: i32) -> EmployeeStatus<i32> {
        EmployeeStatus {
            employee_id: id.to_string(),
            employee_name: id.to_string(),
            lifecycle_ready: ready,
            extra,
        }
    }

    #[test]
    fn test_partition_disjoint() {
        let expected = vec![employee("a", true, 1), employee("b", true, 1), employee("c", true, 1)];
        let current = vec![employee("b", false, 1), employee("c", true, 1), employee("d", true, 1)];

        let c = diff_employees(&expected, &current).unwrap();
        let ids = |v: &[EmployeeStatus<i32>]| {
            v.iter().map(|s| s.employee_id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&c.to_create), vec!["a"]);
        assert_eq!(ids(&c.to_update), vec!["b"]);
        assert_eq!(ids(&c.to_delete), vec!["d"]);
        assert_eq!(ids(&c.unchanged), vec!["c"]);
    }

    #[test]
    fn test_converged_pair_yields_empty_classification() {
        let expected = vec![employee("a", true, 1), employee("b", false, 2)];
        let current = expected.clone();

        let c = diff_employees(&expected, &current).unwrap();
        assert!(c.is_converged());
        assert_eq!(c.unchanged.len(), 2);

        // Idempotence: diffing the converged state again stays empty
        let again = diff_employees(&expected, &current).unwrap();
        assert!(again.is_converged());
    }

    #[test]
    fn test_readiness_flip_is_an_update() {
        let expected = vec![employee("a", true, 1)];
        let current = vec![employee("a", false, 1)];
        let c = diff_employees(&expected, &current).unwrap();
        assert_eq!(c.to_update.len(), 1);
        assert!(c.to_update[0].lifecycle_ready);
    }

    #[test]
    fn test_update_carries_expected_snapshot() {
        let expected = vec![employee("a", true, 42)];
        let current = vec![employee("a", true, 7)];
        let c = diff_employees(&expected, &current).unwrap();
        assert_eq!(c.to_update[0].extra, 42);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let expected = vec![employee("a", true, 1), employee("a", true, 2)];
        let err = diff_employees(&expected, &[]).unwrap_err();
        assert!(matches!(err, Error::AdapterContract(_)));
    }

    #[test]
    fn test_empty_expected_deletes_all() {
        let current = vec![employee("a", true, 1), employee("b", true, 1)];
        let c = diff_employees(&[], &current).unwrap();
        assert_eq!(c.to_delete.len(), 2);
        assert!(c.to_create.is_empty());
        assert!(c.to_update.is_empty());
    }

    #[test]
    fn test_employer_diff() {
        let expected = vec![EmployerStatus {
            employer_id: "vip".to_string(),
            extra: 100,
        }];
        let current = vec![EmployerStatus {
            employer_id: "vip".to_string(),
            extra: 50,
        }];
        let c = diff_employers(&expected, &current).unwrap();
        assert_eq!(c.to_update.len(), 1);
        assert_eq!(c.to_update[0].extra, 100);
        assert!(diff_employers(&expected, &expected).unwrap().is_converged());
    }
}
