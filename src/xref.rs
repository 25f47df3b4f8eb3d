//! Cross-reference table: object number to byte offset (or object-stream
//! slot) lookup, merged across the `/Prev` chain.

use crate::primitive::{GenNr, ObjNr};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XRef {
    /// Freed slot; resolving it yields Null.
    Free { next_obj_nr: ObjNr, gen_nr: GenNr },
    /// In use, at a byte offset in the file.
    Raw { pos: usize, gen_nr: GenNr },
    /// In use, compressed inside an object stream.
    Stream { stream_id: ObjNr, index: usize },
}

/// Sparse lookup table. Entries are inserted newest revision first; the first
/// entry for an object number wins, older revisions never overwrite it.
#[derive(Default)]
pub struct XRefTable {
    entries: HashMap<ObjNr, XRef>,
    size: ObjNr,
}

impl XRefTable {
    pub fn new() -> XRefTable {
        XRefTable::default()
    }

    pub fn get(&self, id: ObjNr) -> Option<XRef> {
        self.entries.get(&id).copied()
    }

    /// Number of entries actually present.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The highest `/Size` seen along the chain: one past the largest valid
    /// object number.
    pub fn size(&self) -> ObjNr {
        self.size
    }
    pub fn observe_size(&mut self, size: ObjNr) {
        self.size = self.size.max(size);
    }

    /// Inserts unless a newer revision already claimed the number.
    pub fn insert_if_absent(&mut self, id: ObjNr, entry: XRef) {
        self.entries.entry(id).or_insert(entry);
    }

    pub fn add_section(&mut self, section: XRefSection) {
        for (i, entry) in section.entries.into_iter().enumerate() {
            self.insert_if_absent(section.first_id + i as ObjNr, entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjNr, XRef)> + '_ {
        self.entries.iter().map(|(&id, &e)| (id, e))
    }
}

impl Debug for XRefTable {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            match self.entries[&id] {
                XRef::Free { next_obj_nr, gen_nr } => {
                    writeln!(f, "{:4}: {:010} {:05} f", id, next_obj_nr, gen_nr)?
                }
                XRef::Raw { pos, gen_nr } => writeln!(f, "{:4}: {:010} {:05} n", id, pos, gen_nr)?,
                XRef::Stream { stream_id, index } => {
                    writeln!(f, "{:4}: in stream {}, index {}", id, stream_id, index)?
                }
            }
        }
        Ok(())
    }
}

/// One contiguous subsection as found in the file.
#[derive(Debug)]
pub struct XRefSection {
    pub first_id: ObjNr,
    pub entries: Vec<XRef>,
}

impl XRefSection {
    pub fn new(first_id: ObjNr) -> XRefSection {
        XRefSection { first_id, entries: Vec::new() }
    }
    pub fn add_free_entry(&mut self, next_obj_nr: ObjNr, gen_nr: GenNr) {
        self.entries.push(XRef::Free { next_obj_nr, gen_nr });
    }
    pub fn add_inuse_entry(&mut self, pos: usize, gen_nr: GenNr) {
        self.entries.push(XRef::Raw { pos, gen_nr });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_revision_wins() {
        let mut table = XRefTable::new();
        // newest first
        table.insert_if_absent(3, XRef::Raw { pos: 200, gen_nr: 0 });
        table.insert_if_absent(3, XRef::Raw { pos: 100, gen_nr: 0 });
        assert_eq!(table.get(3), Some(XRef::Raw { pos: 200, gen_nr: 0 }));
        assert_eq!(table.get(4), None);
    }

    #[test]
    fn sections_expand_to_entries() {
        let mut section = XRefSection::new(5);
        section.add_free_entry(0, 65535);
        section.add_inuse_entry(1234, 0);
        let mut table = XRefTable::new();
        table.add_section(section);
        assert_eq!(table.get(5), Some(XRef::Free { next_obj_nr: 0, gen_nr: 65535 }));
        assert_eq!(table.get(6), Some(XRef::Raw { pos: 1234, gen_nr: 0 }));
    }
}
