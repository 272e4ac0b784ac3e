//! Strip range expressions like `"P1-P10, P42"`.

use crate::error::BenchError;

/// Split `expression` by `separator`, trimming tokens and dropping empty ones.
pub fn tokenize<'a>(expression: &'a str, separator: char) -> impl Iterator<Item = &'a str> + 'a {
    expression
        .split(separator)
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Names from `start` to `end` (inclusive) in declaration order.
pub fn extract_slice<S: AsRef<str>>(
    names: &[S],
    start: &str,
    end: &str,
) -> Result<Vec<String>, BenchError> {
    let index = |name: &str| {
        names
            .iter()
            .position(|n| n.as_ref() == name)
            .ok_or_else(|| BenchError::Validation(format!("no such strip: {name}")))
    };
    let start_index = index(start)?;
    let end_index = index(end)?;
    if start_index > end_index {
        return Err(BenchError::Validation(format!(
            "invalid strip slice: {start}, {end}"
        )));
    }
    Ok(names[start_index..=end_index]
        .iter()
        .map(|n| n.as_ref().to_string())
        .collect())
}

/// Continuous runs of `selected` names within `all`.
pub fn create_slices<S: AsRef<str>>(all: &[S], selected: &[S]) -> Vec<Vec<String>> {
    let mut slices = Vec::new();
    let mut run: Vec<String> = Vec::new();
    for name in all {
        let name = name.as_ref();
        if selected.iter().any(|s| s.as_ref() == name) {
            run.push(name.to_string());
        } else if !run.is_empty() {
            slices.push(std::mem::take(&mut run));
        }
    }
    if !run.is_empty() {
        slices.push(run);
    }
    slices
}

/// Canonical spelling of a strip expression: `" 4 ,2,8  - 16 "` becomes `"4, 2, 8-16"`.
pub fn normalize_strip_expression(expression: &str) -> String {
    let compact: String = expression.chars().filter(|c| !c.is_whitespace()).collect();
    compact.replace(',', ", ")
}

/// Parse an expression into `(start, end)` name pairs.
///
/// Single names yield `(name, name)`.
pub fn parse_strip_expression(expression: &str) -> Vec<(String, String)> {
    tokenize(expression, ',')
        .map(|token| match token.split_once('-') {
            Some((start, end)) => (start.trim().to_string(), end.trim().to_string()),
            None => (token.to_string(), token.to_string()),
        })
        .collect()
}

/// Expand an expression to the selected names, deduplicated, in declaration order.
pub fn parse_strips<S: AsRef<str>>(names: &[S], expression: &str) -> Result<Vec<String>, BenchError> {
    let mut selected = vec![false; names.len()];
    for (start, end) in parse_strip_expression(expression) {
        for name in extract_slice(names, &start, &end)? {
            if let Some(index) = names.iter().position(|n| n.as_ref() == name) {
                selected[index] = true;
            }
        }
    }
    Ok(names
        .iter()
        .zip(selected)
        .filter(|(_, selected)| *selected)
        .map(|(name, _)| name.as_ref().to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("P{i}")).collect()
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("", ';').count(), 0);
        assert_eq!(tokenize(";", ';').count(), 0);
        assert_eq!(tokenize("A; B ;C;;", ';').collect::<Vec<_>>(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_extract_slice() {
        let names = names(7);
        assert_eq!(extract_slice(&names, "P1", "P1").unwrap(), vec!["P1"]);
        assert_eq!(extract_slice(&names, "P3", "P6").unwrap(), vec!["P3", "P4", "P5", "P6"]);
        assert!(extract_slice(&names, "P2", "P1").is_err());
        assert!(extract_slice(&names, "P1", "P9").is_err());
    }

    #[test]
    fn test_create_slices() {
        let all = names(6);
        let selected: Vec<String> = ["P1", "P2", "P4", "P6"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            create_slices(&all, &selected),
            vec![vec!["P1", "P2"], vec!["P4"], vec!["P6"]]
        );
    }

    #[test]
    fn test_normalize_strip_expression() {
        assert_eq!(normalize_strip_expression(" 4 ,2,8  - 16  , 42 "), "4, 2, 8-16, 42");
    }

    #[test]
    fn test_parse_strip_expression() {
        assert!(parse_strip_expression("").is_empty());
        assert_eq!(
            parse_strip_expression("P1, P3-P4, P7"),
            vec![
                ("P1".to_string(), "P1".to_string()),
                ("P3".to_string(), "P4".to_string()),
                ("P7".to_string(), "P7".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_strips() {
        let names = names(10);
        assert!(parse_strips(&names, "").unwrap().is_empty());
        assert_eq!(parse_strips(&names, "P2, P2").unwrap(), vec!["P2"]);
        assert_eq!(parse_strips(&names, "P1, P3, P2, P1").unwrap(), vec!["P1", "P2", "P3"]);
        assert_eq!(
            parse_strips(&names, "P8-P10, P1-P2, P1-P3, P3").unwrap(),
            vec!["P1", "P2", "P3", "P8", "P9", "P10"]
        );
        assert_eq!(
            parse_strips(&names, "P1-P3, P2-P5").unwrap(),
            vec!["P1", "P2", "P3", "P4", "P5"]
        );
        assert!(parse_strips(&names, "P3-P1").is_err());
        assert!(parse_strips(&names, "P42").is_err());
    }
}
