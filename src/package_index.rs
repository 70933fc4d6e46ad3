use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use tracing::instrument;

use crate::ser::*;

/// Reference into a package's import or export table.
///
/// Positive values are `export index + 1`, negative values are `-(import index + 1)` and zero is null.
/// Tables can be reordered freely as long as every stored index is remapped afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FPackageIndex {
    index: i32,
}
impl FPackageIndex {
    pub fn create_null() -> Self {
        Self { index: 0 }
    }
    pub fn create_import(import_index: usize) -> Self {
        Self { index: -(import_index as i32) - 1 }
    }
    pub fn create_export(export_index: usize) -> Self {
        Self { index: export_index as i32 + 1 }
    }
    pub fn from_raw(index: i32) -> Self {
        Self { index }
    }
    pub fn to_raw(self) -> i32 {
        self.index
    }
    pub fn is_null(self) -> bool {
        self.index == 0
    }
    pub fn is_import(self) -> bool {
        self.index < 0
    }
    pub fn is_export(self) -> bool {
        self.index > 0
    }
    pub fn import(self) -> Option<usize> {
        self.is_import().then(|| (-self.index - 1) as usize)
    }
    pub fn export(self) -> Option<usize> {
        self.is_export().then(|| (self.index - 1) as usize)
    }
}
impl Display for FPackageIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(i) = self.import() {
            write!(f, "Import({i})")
        } else if let Some(e) = self.export() {
            write!(f, "Export({e})")
        } else {
            write!(f, "Null")
        }
    }
}
impl Readable for FPackageIndex {
    #[instrument(skip_all, name = "FPackageIndex")]
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        Ok(Self { index: s.de()? })
    }
}
impl Writeable for FPackageIndex {
    #[instrument(skip_all, name = "FPackageIndex")]
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_package_index_encoding() {
        assert!(FPackageIndex::create_null().is_null());
        assert_eq!(FPackageIndex::create_export(0).to_raw(), 1);
        assert_eq!(FPackageIndex::create_import(0).to_raw(), -1);
        assert_eq!(FPackageIndex::create_import(4).import(), Some(4));
        assert_eq!(FPackageIndex::create_import(4).export(), None);
        assert_eq!(FPackageIndex::create_export(7).export(), Some(7));
        assert_eq!(FPackageIndex::from_raw(-3).to_string(), "Import(2)");
    }
}
