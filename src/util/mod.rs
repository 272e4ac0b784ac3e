//! Small supporting utilities: stopwatch, ramps, statistics, strip expressions and metric values.

pub mod metric;
pub mod range;
pub mod stats;
pub mod strips;
pub mod timer;

pub use metric::{format_metric, parse_metric};
pub use range::linear_range;
pub use strips::{
    create_slices, extract_slice, normalize_strip_expression, parse_strip_expression,
    parse_strips, tokenize,
};
pub use timer::{Estimate, Timer};
