use crate::error::{LaunchError, Result};
use std::{fmt, str::FromStr};

/// Contents of a `/proc/<pid>/uid_map` or `/proc/<pid>/gid_map` file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdMap {
    mappings: Vec<Mapping>,
}

/// Maps `[outer_id, outer_id + count)` outside the namespace to `[inner_id, inner_id + count)`
/// inside.
#[derive(Clone, Debug, Copy, Eq, PartialEq)]
struct Mapping {
    inner_id: u32,
    outer_id: u32,
    count: u32,
}

impl IdMap {
    /// Kernel limit on the number of lines in a map file.
    pub const MAX_LINES: usize = 340;

    /// Map a single outer ID to a single inner ID.
    pub fn single(outer_id: u32, inner_id: u32) -> IdMap {
        IdMap {
            mappings: vec![Mapping {
                inner_id,
                outer_id,
                count: 1,
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    fn parse_line(line: &str) -> Result<Mapping> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [inner, outer, count] = fields.as_slice() else {
            return Err(invalid(format!(
                "id map entry {line:?} must have exactly three fields"
            )));
        };

        let number = |field: &str| {
            field
                .parse::<u32>()
                .map_err(|_| invalid(format!("id map field {field:?} is not an unsigned id")))
        };

        let mapping = Mapping {
            inner_id: number(*inner)?,
            outer_id: number(*outer)?,
            count: number(*count)?,
        };

        if mapping.count == 0 {
            return Err(invalid(format!("id map entry {line:?} has a zero count")));
        }

        Ok(mapping)
    }
}

impl FromStr for IdMap {
    type Err = LaunchError;

    /// Accepts newline or comma separated `inside outside count` entries.
    fn from_str(s: &str) -> Result<Self> {
        let mappings = s
            .split(['\n', ','])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(IdMap::parse_line)
            .collect::<Result<Vec<_>>>()?;

        if mappings.is_empty() {
            return Err(invalid("id map is empty".to_string()));
        }
        if mappings.len() > Self::MAX_LINES {
            return Err(invalid(format!(
                "id map has {} entries, the kernel accepts at most {}",
                mappings.len(),
                Self::MAX_LINES
            )));
        }

        Ok(IdMap { mappings })
    }
}

/// Renders the map in the kernel's file format.
impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for mapping in &self.mappings {
            writeln!(
                f,
                "{} {} {}",
                mapping.inner_id, mapping.outer_id, mapping.count
            )?;
        }
        Ok(())
    }
}

fn invalid(message: String) -> LaunchError {
    LaunchError::InvalidRequest(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_multiple_entries() {
        let map: IdMap = "0 100000 1000\n1000 1000 1".parse().unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.to_string(), "0 100000 1000\n1000 1000 1\n");
    }

    #[test]
    fn test_comma_separated_entries_render_as_lines() {
        let map: IdMap = "0 1000 1, 1 100000 65536".parse().unwrap();
        assert_eq!(map.to_string(), "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn test_rejects_malformed_entries() {
        assert!("0 1000".parse::<IdMap>().is_err());
        assert!("0 1000 0".parse::<IdMap>().is_err());
        assert!("root 1000 1".parse::<IdMap>().is_err());
        assert!("-1 1000 1".parse::<IdMap>().is_err());
        assert!("".parse::<IdMap>().is_err());
    }

    #[test]
    fn test_single_mapping() {
        assert_eq!(IdMap::single(1000, 0).to_string(), "0 1000 1\n");
    }
}
