use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use tracing::instrument;

use crate::ser::*;

fn name_hash(name: &str) -> u64 {
    if name.is_ascii() {
        cityhasher::hash(name.as_bytes())
    } else {
        cityhasher::hash(name.encode_utf16().flat_map(|s| s.to_le_bytes()).collect::<Vec<u8>>())
    }
}

/// Breaks down a combined FName string into a base name and a number. Number is 0 if there is no number
pub(crate) fn break_down_name_string<'a>(name: &'a str) -> (&'a str, i32) {
    let mut name_without_number: &'a str = name;
    let mut name_number: i32 = 0; // 0 means no number

    // Attempt to break down the composite name into the name part and the number part
    if let Some((left, right)) = name.rsplit_once('_') {
        // Right part needs to be parsed as a valid signed integer that is >= 0 and converts back to the same string
        // Last part is important for not touching names like: Rocket_04 - 04 should stay a part of the name, not a number, otherwise we would actually get Rocket_4 when deserializing!
        if let Ok(parsed_number) = right.parse::<i32>()
            && parsed_number >= 0
            && parsed_number.to_string() == right
        {
            name_without_number = left;
            name_number = parsed_number + 1; // stored as 1 more than the actual number
        }
    }
    (name_without_number, name_number)
}

/// Name reference as stored in the package tables: index into the name table plus instance number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FName {
    pub index: i32,
    pub number: i32,
}
impl Readable for FName {
    #[instrument(skip_all, name = "FName")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self { index: s.de()?, number: s.de()? })
    }
}
impl Writeable for FName {
    #[instrument(skip_all, name = "FName")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.index)?;
        s.ser(&self.number)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FNameEntrySerialized {
    name: String,
    non_case_preserving_hash: u16,
    case_preserving_hash: u16,
}
impl FNameEntrySerialized {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            non_case_preserving_hash: (name_hash(&name.to_ascii_lowercase()) & 0xFFFF) as u16,
            case_preserving_hash: (name_hash(name) & 0xFFFF) as u16,
        }
    }
}
impl Readable for FNameEntrySerialized {
    #[instrument(skip_all, name = "FNameEntrySerialized")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self {
            name: s.de()?,
            non_case_preserving_hash: s.de()?,
            case_preserving_hash: s.de()?,
        })
    }
}
impl Writeable for FNameEntrySerialized {
    #[instrument(skip_all, name = "FNameEntrySerialized")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.name)?;
        s.ser(&self.non_case_preserving_hash)?;
        s.ser(&self.case_preserving_hash)?;
        Ok(())
    }
}

/// Deduplicated table of base names referenced by a package.
///
/// Numeric instance suffixes (`Foo_3`) are not stored in the table; they live in the [`FName`] referencing it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FNameTable {
    names: Vec<String>,
    name_lookup: HashMap<String, usize>,
}
impl FNameTable {
    #[instrument(skip_all, name = "FNameTable")]
    pub fn deserialize<S: Read>(s: &mut S, count: usize) -> Result<Self> {
        let entries: Vec<FNameEntrySerialized> = s.de_ctx(count)?;
        Ok(Self::create_from_names(entries.into_iter().map(|e| e.name).collect()))
    }
    #[instrument(skip_all, name = "FNameTable")]
    pub fn serialize<S: Write>(&self, s: &mut S) -> Result<()> {
        for name in &self.names {
            s.ser(&FNameEntrySerialized::new(name))?;
        }
        Ok(())
    }
}

impl FNameTable {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn create_from_names(names: Vec<String>) -> Self {
        let mut name_lookup: HashMap<String, usize> = HashMap::with_capacity(names.len());
        for (name_index, name) in names.iter().cloned().enumerate() {
            name_lookup.entry(name).or_insert(name_index);
        }
        Self { names, name_lookup }
    }

    /// Records that `name` is used by the package. Calling this again for the same base name has no effect.
    pub fn mark_name_referenced(&mut self, name: &str) {
        let (base, _) = break_down_name_string(name);
        if !self.name_lookup.contains_key(base) {
            self.name_lookup.insert(base.to_string(), self.names.len());
            self.names.push(base.to_string());
        }
    }
    pub fn contains(&self, name: &str) -> bool {
        self.name_lookup.contains_key(break_down_name_string(name).0)
    }
    pub fn len(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Maps a full name string to its table reference. Every name must have been marked beforehand.
    pub fn resolve(&self, name: &str) -> Result<FName> {
        let (base, number) = break_down_name_string(name);
        let Some(index) = self.name_lookup.get(base) else {
            bail!("name {name:?} was never marked as referenced");
        };
        Ok(FName { index: *index as i32, number })
    }
    pub fn get(&self, name: FName) -> Result<String> {
        let base = usize::try_from(name.index)
            .ok()
            .and_then(|i| self.names.get(i))
            .with_context(|| format!("name index {} out of range ({} names)", name.index, self.names.len()))?;
        Ok(if name.number != 0 { format!("{base}_{}", name.number - 1) } else { base.clone() })
    }

    /// Orders the table against a previously saved one: the previous table is kept as a prefix
    /// (including names no longer used) and new names follow, sorted case-insensitively.
    pub fn conform_to(&mut self, previous: &[String]) {
        let mut conformed = previous.to_vec();
        let mut new_names: Vec<String> = self.names.iter().filter(|n| !previous.contains(n)).cloned().collect();
        new_names.sort_by_key(|n| n.to_ascii_lowercase());
        conformed.extend(new_names);
        *self = Self::create_from_names(conformed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_break_down_name_string() {
        assert_eq!(break_down_name_string("Rocket"), ("Rocket", 0));
        assert_eq!(break_down_name_string("Rocket_0"), ("Rocket", 1));
        assert_eq!(break_down_name_string("Rocket_12"), ("Rocket", 13));
        assert_eq!(break_down_name_string("Rocket_04"), ("Rocket_04", 0));
        assert_eq!(break_down_name_string("Rocket_"), ("Rocket_", 0));
    }

    #[test]
    fn test_mark_name_referenced_is_idempotent() -> Result<()> {
        let mut table = FNameTable::new();
        table.mark_name_referenced("Cube");
        table.mark_name_referenced("Cube_2");
        table.mark_name_referenced("Cube");
        table.mark_name_referenced("StaticMesh");
        assert_eq!(table.names(), &["Cube".to_string(), "StaticMesh".to_string()]);

        let name = table.resolve("Cube_2")?;
        assert_eq!(name, FName { index: 0, number: 3 });
        assert_eq!(table.get(name)?, "Cube_2");
        assert!(table.resolve("Sphere").is_err());
        Ok(())
    }

    #[test]
    fn test_conform_keeps_previous_prefix() {
        let mut table = FNameTable::new();
        for name in ["zeta", "Root", "Alpha", "None"] {
            table.mark_name_referenced(name);
        }
        let previous = vec!["None".to_string(), "Root".to_string(), "Removed".to_string()];
        table.conform_to(&previous);
        assert_eq!(table.names(), &["None", "Root", "Removed", "Alpha", "zeta"]);
        assert!(table.contains("Removed"));
    }

    #[test]
    fn test_name_table_serialization() -> Result<()> {
        let table = FNameTable::create_from_names(vec!["None".into(), "Caf\u{e9}".into()]);
        let mut buf = vec![];
        table.serialize(&mut buf)?;
        let read = FNameTable::deserialize(&mut Cursor::new(buf), 2)?;
        assert_eq!(read.names(), table.names());
        Ok(())
    }
}
