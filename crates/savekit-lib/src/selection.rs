//! Job selection expressions: `3`, `3-7` (inclusive) or `1;3;5`.

use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("Empty job selection")]
    Empty,
    #[error("Invalid job selection '{0}'")]
    Invalid(String),
    #[error("Job index {index} is out of range (0..{count})")]
    OutOfRange { index: usize, count: usize },
}

/// Parses `expr` into sorted, de-duplicated job indices, each checked
/// against `job_count`.
pub fn parse_selection(expr: &str, job_count: usize) -> Result<Vec<usize>, SelectionError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(SelectionError::Empty);
    }

    let mut indices = BTreeSet::new();
    if expr.contains(';') {
        for part in expr.split(';') {
            indices.insert(parse_index(part, expr)?);
        }
    } else if let Some((start, end)) = expr.split_once('-') {
        let start = parse_index(start, expr)?;
        let end = parse_index(end, expr)?;
        if start > end {
            return Err(SelectionError::Invalid(expr.to_string()));
        }
        check_range(end, job_count)?;
        indices.extend(start..=end);
    } else {
        indices.insert(parse_index(expr, expr)?);
    }

    for &index in &indices {
        check_range(index, job_count)?;
    }
    Ok(indices.into_iter().collect())
}

fn parse_index(part: &str, expr: &str) -> Result<usize, SelectionError> {
    part.trim()
        .parse()
        .map_err(|_| SelectionError::Invalid(expr.to_string()))
}

fn check_range(index: usize, count: usize) -> Result<(), SelectionError> {
    if index >= count {
        Err(SelectionError::OutOfRange { index, count })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_index() {
        assert_eq!(parse_selection("3", 10), Ok(vec![3]));
        assert_eq!(parse_selection(" 0 ", 1), Ok(vec![0]));
    }

    #[test]
    fn test_inclusive_range() {
        assert_eq!(parse_selection("2-4", 10), Ok(vec![2, 3, 4]));
        assert_eq!(parse_selection("5-5", 10), Ok(vec![5]));
    }

    #[test]
    fn test_explicit_list() {
        assert_eq!(parse_selection("1;3;5", 10), Ok(vec![1, 3, 5]));
        assert_eq!(parse_selection("5; 1 ;5", 10), Ok(vec![1, 5]));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(
            parse_selection("11", 10),
            Err(SelectionError::OutOfRange { index: 11, count: 10 })
        );
        assert_eq!(
            parse_selection("8-10", 10),
            Err(SelectionError::OutOfRange { index: 10, count: 10 })
        );
        assert!(matches!(
            parse_selection("0", 0),
            Err(SelectionError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_unparseable() {
        assert_eq!(parse_selection("", 3), Err(SelectionError::Empty));
        assert!(matches!(parse_selection("a", 3), Err(SelectionError::Invalid(_))));
        assert!(matches!(parse_selection("4-2", 10), Err(SelectionError::Invalid(_))));
        assert!(matches!(parse_selection("1;;2", 10), Err(SelectionError::Invalid(_))));
        assert!(matches!(parse_selection("-1", 10), Err(SelectionError::Invalid(_))));
    }
}
