//! Maps an engine-reported character offset back to a line in the script.

use std::fmt;

/// Where in a migration script a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// 1-based line number.
    pub line: usize,
    /// 1-based column, counted in characters.
    pub column: usize,
    /// The full text of the failing line.
    pub snippet: String,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.snippet.trim())
    }
}

/// Resolves a 1-based character `position` in `sql` to a line and column.
///
/// Returns `None` when the position lies outside the text.
pub fn locate(sql: &str, position: u32) -> Option<SourceLocation> {
    let mut remaining = usize::try_from(position).ok()?.checked_sub(1)?;

    for (idx, line) in sql.split('\n').enumerate() {
        let width = line.chars().count();
        if remaining <= width {
            return Some(SourceLocation {
                line: idx + 1,
                column: remaining + 1,
                snippet: line.trim_end_matches('\r').to_string(),
            });
        }
        // Skip the line and its newline.
        remaining -= width + 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "CREATE TABLE a (id INT);\nCREATE TABEL b (id INT);\n";

    #[test]
    fn position_on_second_line() {
        // "CREATE TABEL" starts at char 26; "TABEL" at 33.
        let loc = locate(SCRIPT, 33).expect("inside the script");
        assert_eq!(loc.line, 2);
        assert_eq!(loc.column, 8);
        assert_eq!(loc.snippet, "CREATE TABEL b (id INT);");
    }

    #[test]
    fn first_character_is_line_one_column_one() {
        let loc = locate(SCRIPT, 1).expect("inside the script");
        assert_eq!((loc.line, loc.column), (1, 1));
    }

    #[test]
    fn out_of_range_positions_are_none() {
        assert_eq!(locate(SCRIPT, 0), None);
        assert_eq!(locate("SELECT 1", 500), None);
    }

    #[test]
    fn columns_count_characters_not_bytes() {
        let loc = locate("SELECT 'é', x FROM", 13).expect("inside the text");
        assert_eq!((loc.line, loc.column), (1, 13));
    }
}
