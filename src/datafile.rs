//! Checker for object-dictionary data files.
//!
//! Each non-comment line carries `<index>, <subindex>, <value>`; numbers may
//! be written in binary (`0b…`), octal (leading `0`), decimal or hex
//! (`0x…`). Bad lines are reported but never abort the run, so a whole file
//! is always validated in one pass.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::dict::{self, DictEntry};
use crate::util::parse_long;

/// Validates a file against the dictionary; returns the bad-line count.
pub fn check_file(path: &Path) -> io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    Ok(check(reader))
}

/// Validates every line of `reader`; returns the number of rejected lines.
pub fn check<R: BufRead>(reader: R) -> usize {
    let mut bad = 0;
    for (lineno, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!("line {}: unreadable: {}", lineno + 1, err);
                bad += 1;
                continue;
            }
        };
        if let Err(reason) = check_line(&line) {
            log::warn!("line {}: {}", lineno + 1, reason);
            bad += 1;
        }
    }
    bad
}

fn check_line(line: &str) -> Result<Option<(&'static DictEntry, i64)>, String> {
    let text = line.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with("//") {
        return Ok(None);
    }

    let fields: Vec<i64> = text
        .split([' ', '\t', ',', ';'])
        .filter(|t| !t.is_empty())
        .map(parse_long)
        .collect::<Option<_>>()
        .ok_or_else(|| format!("non-numeric field in {:?}", text))?;
    if fields.len() != 3 {
        return Err(format!(
            "expected `index, subindex, value`, got {} fields",
            fields.len()
        ));
    }

    let index =
        u16::try_from(fields[0]).map_err(|_| format!("index {} out of range", fields[0]))?;
    let subindex =
        u8::try_from(fields[1]).map_err(|_| format!("subindex {} out of range", fields[1]))?;
    let entry = dict::find(index, subindex)
        .ok_or_else(|| format!("0x{:04X}/{} is not in the dictionary", index, subindex))?;

    let value = fields[2];
    if !value_fits(entry, value) {
        return Err(format!(
            "value {} does not fit {} ({} byte(s), {})",
            value,
            entry.name,
            entry.datasize,
            if entry.signed { "signed" } else { "unsigned" }
        ));
    }
    Ok(Some((entry, value)))
}

fn value_fits(entry: &DictEntry, value: i64) -> bool {
    match (entry.signed, entry.datasize) {
        (true, 1) => i8::try_from(value).is_ok(),
        (true, 2) => i16::try_from(value).is_ok(),
        (true, _) => i32::try_from(value).is_ok(),
        (false, 1) => u8::try_from(value).is_ok(),
        (false, 2) => u16::try_from(value).is_ok(),
        (false, _) => u32::try_from(value).is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn accepts_all_bases_and_comments() {
        let data = "\
# rotation, then a relative move
0x6002, 0, 1
0x6004 0 0b10010110000
0x6003;0;-0750
";
        assert_eq!(check(Cursor::new(data)), 0);
    }

    #[test]
    fn reports_but_does_not_stop() {
        let data = "\
0x6002, 0, 1
0x6041, 0, 1
0x6002, 0, 300
0x6002, 0, -1
banana
0x6002, 0
0x6004, 0, 7
";
        // unknown entry, oversized value, negative into unsigned, garbage,
        // missing field - and the good lines still pass
        assert_eq!(check(Cursor::new(data)), 5);
    }

    #[test]
    fn signed_entries_accept_negative_values() {
        assert!(check_line("0x6003, 0, -200000").unwrap().is_some());
        assert!(check_line("0x601C, 0, -1").unwrap().is_some());
        assert!(check_line("0x6003, 0, 0x80000000").is_err());
    }
}
