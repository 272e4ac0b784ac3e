//! Padfile parsing and needle geometry.
//!
//! A padfile lists the contact pads of one sensor type:
//!
//! ```text
//! # comment
//! pitch: 80
//! reference pad: 1
//! reference pad: 64
//! reference pad: 512
//!
//! strip   x       y       z
//! 1       0       0       0
//! 2       0       -80     0
//! ```

use super::Position;
use crate::error::BenchError;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::OnceLock;

/// A single contact pad with its design position.
#[derive(Debug, Clone, PartialEq)]
pub struct Pad {
    /// Pad (strip) name.
    pub name: String,
    /// Design x in micrometers.
    pub x: i64,
    /// Design y in micrometers.
    pub y: i64,
    /// Design z in micrometers.
    pub z: i64,
}

impl Pad {
    /// Design position as floating point coordinates.
    pub fn position(&self) -> Position {
        Position::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

/// Ordered collection of pads plus reference pads and free properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Padfile {
    properties: BTreeMap<String, String>,
    pads: Vec<Pad>,
    references: Vec<String>,
}

struct Patterns {
    property: Regex,
    header: Regex,
    pad: Regex,
}

#[allow(clippy::expect_used)]
fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        property: Regex::new(r"^([^:]+):(.*)$").expect("static pattern"),
        header: Regex::new(r"^strip\s+x\s+y\s+z$").expect("static pattern"),
        pad: Regex::new(r"^(\w+)\s+([+-]?\d+)\s+([+-]?\d+)\s+([+-]?\d+)$").expect("static pattern"),
    })
}

fn sanitize_property_name(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}

impl Padfile {
    /// Parse padfile text.
    pub fn parse(text: &str) -> Result<Self, BenchError> {
        let patterns = patterns();
        let mut padfile = Padfile::default();
        let mut references = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || patterns.header.is_match(line) {
                continue;
            }
            if let Some(captures) = patterns.property.captures(line) {
                let name = sanitize_property_name(&captures[1]);
                let value = captures[2].trim().to_string();
                if name == "reference_pad" {
                    references.push(value);
                } else {
                    padfile.properties.insert(name, value);
                }
                continue;
            }
            if let Some(captures) = patterns.pad.captures(line) {
                let coordinate = |i: usize| {
                    captures[i].parse::<i64>().map_err(|err| {
                        BenchError::Validation(format!("padfile line {}: {err}", index + 1))
                    })
                };
                let (x, y, z) = (coordinate(2)?, coordinate(3)?, coordinate(4)?);
                padfile.add_pad(captures[1].trim(), x, y, z)?;
                continue;
            }
            return Err(BenchError::Validation(format!(
                "padfile line {}: unexpected content: {line:?}",
                index + 1
            )));
        }
        for name in references {
            padfile.set_reference(&name)?;
        }
        Ok(padfile)
    }

    /// Read and parse a padfile from disk.
    pub fn load(path: &std::path::Path) -> Result<Self, BenchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| BenchError::Io(format!("{}: {err}", path.display())))?;
        Self::parse(&text)
    }

    /// Serialize back into padfile text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.properties {
            let _ = writeln!(out, "{key}: {value}");
        }
        if !self.properties.is_empty() {
            out.push('\n');
        }
        for name in &self.references {
            let _ = writeln!(out, "reference pad: {name}");
        }
        if !self.references.is_empty() {
            out.push('\n');
        }
        out.push_str("strip\tx\ty\tz\n");
        for pad in &self.pads {
            let _ = writeln!(out, "{}\t{}\t{}\t{}", pad.name, pad.x, pad.y, pad.z);
        }
        out
    }

    /// Set a free property.
    pub fn set_property(&mut self, name: &str, value: &str) {
        self.properties
            .insert(sanitize_property_name(name), value.trim().to_string());
    }

    /// Look up a property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Append a pad, names must be unique.
    pub fn add_pad(&mut self, name: &str, x: i64, y: i64, z: i64) -> Result<(), BenchError> {
        if self.pad(name).is_some() {
            return Err(BenchError::Validation(format!("pad already exists: {name}")));
        }
        self.pads.push(Pad {
            name: name.to_string(),
            x,
            y,
            z,
        });
        Ok(())
    }

    /// Mark an existing pad as alignment reference.
    pub fn set_reference(&mut self, name: &str) -> Result<(), BenchError> {
        if self.pad(name).is_none() {
            return Err(BenchError::Validation(format!("no such reference pad: {name}")));
        }
        if !self.references.iter().any(|r| r == name) {
            self.references.push(name.to_string());
        }
        Ok(())
    }

    /// Pads in declaration order.
    pub fn pads(&self) -> &[Pad] {
        &self.pads
    }

    /// Pad names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.pads.iter().map(|pad| pad.name.clone()).collect()
    }

    /// Look up a pad by name.
    pub fn pad(&self, name: &str) -> Option<&Pad> {
        self.pads.iter().find(|pad| pad.name == name)
    }

    /// Declaration index of a pad.
    pub fn index(&self, name: &str) -> Option<usize> {
        self.pads.iter().position(|pad| pad.name == name)
    }

    /// Reference pads in declaration order.
    pub fn references(&self) -> Vec<&Pad> {
        self.references
            .iter()
            .filter_map(|name| self.pad(name))
            .collect()
    }

    /// Pad located exactly at `position`.
    pub fn find_pad(&self, x: i64, y: i64, z: i64) -> Option<&Pad> {
        self.pads
            .iter()
            .find(|pad| pad.x == x && pad.y == y && pad.z == z)
    }
}

/// Geometry of a needle card contacting `count + 1` neighbouring pads.
#[derive(Debug, Clone)]
pub struct NeedlesGeometry {
    pitch: i64,
    count: usize,
}

impl NeedlesGeometry {
    /// Build from the `pitch` property of a padfile.
    pub fn new(padfile: &Padfile, count: usize) -> Self {
        let pitch = padfile
            .property("pitch")
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.abs() as i64)
            .unwrap_or(0);
        Self { pitch, count }
    }

    /// Relative offsets of every needle.
    pub fn offsets(&self) -> Vec<(i64, i64, i64)> {
        let mut offsets = vec![(0, 0, 0)];
        if self.pitch != 0 {
            offsets.extend(std::iter::repeat((0, -self.pitch, 0)).take(self.count));
        }
        offsets
    }

    /// A pad is valid if every needle lands on an existing pad.
    pub fn is_pad_valid(&self, padfile: &Padfile, pad: &Pad) -> bool {
        self.offsets()
            .iter()
            .all(|(a, b, c)| padfile.find_pad(pad.x + a, pad.y + b, pad.z + c).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PADFILE: &str = "# test sensor\n\
        pitch: 80\n\
        reference pad: 1\n\
        reference pad: 3\n\
        reference pad: 4\n\
        \n\
        strip\tx\ty\tz\n\
        1\t0\t0\t0\n\
        2\t0\t-80\t0\n\
        3\t0\t-160\t0\n\
        4\t500\t-160\t0\n";

    #[test]
    fn test_parse_padfile() {
        let padfile = Padfile::parse(PADFILE).unwrap();
        assert_eq!(padfile.property("pitch"), Some("80"));
        assert_eq!(padfile.names(), vec!["1", "2", "3", "4"]);
        let references: Vec<_> = padfile.references().iter().map(|p| p.name.clone()).collect();
        assert_eq!(references, vec!["1", "3", "4"]);
        assert_eq!(padfile.index("3"), Some(2));
    }

    #[test]
    fn test_dump_roundtrip() {
        let padfile = Padfile::parse(PADFILE).unwrap();
        let again = Padfile::parse(&padfile.dump()).unwrap();
        assert_eq!(padfile, again);
    }

    #[test]
    fn test_invalid_padfiles() {
        assert!(Padfile::parse("1 0 0 0\n1 0 0 0\n").is_err());
        assert!(Padfile::parse("reference pad: 9\n1 0 0 0\n").is_err());
        assert!(Padfile::parse("1 0 zero 0\n").is_err());
    }

    #[test]
    fn test_needles_geometry() {
        let padfile = Padfile::parse(PADFILE).unwrap();
        let geometry = NeedlesGeometry::new(&padfile, 1);
        let valid = |name: &str| geometry.is_pad_valid(&padfile, padfile.pad(name).unwrap());
        assert!(valid("1"));
        assert!(valid("2"));
        assert!(!valid("3"));
        assert!(!valid("4"));
    }
}
