//! Strip selection of a top level item.

use super::item::SequenceItem;
use crate::error::AppResult;
use crate::util::parse_strips;
use std::collections::HashSet;

/// One selected strip with the strip items to run on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripPattern {
    /// Strip name.
    pub strip: String,
    /// Declaration index of the strip in the padfile.
    pub index: usize,
    /// Indices into the parent's children, in declaration order.
    pub children: Vec<usize>,
}

/// Strips selected by `item` with the enabled strip items whose interval
/// divides the strip index.
///
/// Strips without any strip item are left out.
pub fn strip_pattern<S: AsRef<str>>(names: &[S], item: &SequenceItem) -> AppResult<Vec<StripPattern>> {
    let selected: HashSet<String> = parse_strips(names, &item.strips)?.into_iter().collect();
    let pattern = names
        .iter()
        .enumerate()
        .filter(|(_, name)| selected.contains(name.as_ref()))
        .filter_map(|(index, name)| {
            let children: Vec<usize> = item
                .children
                .iter()
                .enumerate()
                .filter(|(_, child)| child.enabled && child.interval > 0 && index % child.interval == 0)
                .map(|(position, _)| position)
                .collect();
            (!children.is_empty()).then(|| StripPattern {
                strip: name.as_ref().to_string(),
                index,
                children,
            })
        })
        .collect();
    Ok(pattern)
}
