//! Index key encoding.
//!
//! An index key is one or more record fields joined into a single byte
//! string whose lexicographic order matches field-by-field record order.
//! Fields are separated by `0x00 0x00` and embedded zero bytes are escaped
//! as `0x00 0x01`, so a separator always sorts below any field content.
//! Trailing empty fields are omitted.
//!
//! A spec with exactly one field and no uniqueness extension stores the
//! field raw, with no escaping. Specs with `fields2` append those extra
//! fields only when every primary field is empty, which keeps otherwise
//! equal empty keys distinct in unique indexes; in that case the primary
//! run is kept in full so the encoding stays unambiguous.

use std::cmp::Ordering;

/// Field separator in a composed key.
pub const SEP: [u8; 2] = [0x00, 0x00];

/// Which record fields an index is built over.
///
/// `fields` are the indexed columns in order. `fields2` extend the key for
/// uniqueness when the primary fields are all empty.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Spec {
    pub fields: Vec<usize>,
    pub fields2: Vec<usize>,
}

/// Access to a record's raw fields. Fields past the end read as empty.
pub trait RawRecord {
    fn count(&self) -> usize;
    fn raw(&self, i: usize) -> &[u8];
}

impl<T: AsRef<[u8]>> RawRecord for [T] {
    fn count(&self) -> usize {
        self.len()
    }

    fn raw(&self, i: usize) -> &[u8] {
        if i < self.len() {
            self[i].as_ref()
        } else {
            &[]
        }
    }
}

impl Spec {
    pub fn new(fields: Vec<usize>) -> Spec {
        Spec {
            fields,
            fields2: Vec::new(),
        }
    }

    /// Builds the encoded key for a record.
    pub fn key<R: RawRecord + ?Sized>(&self, rec: &R) -> Vec<u8> {
        if self.fields.is_empty() {
            return Vec::new();
        }
        if self.fields.len() == 1 && self.fields2.is_empty() {
            // no escape for a single field
            return rec.raw(self.fields[0]).to_vec();
        }
        let mut enc = Encoder::new();
        for f in self.effective_fields(rec) {
            enc.add(rec.raw(f));
        }
        enc.finish()
    }

    /// The field list actually encoded: the primary fields, extended by
    /// `fields2` when the primary fields are all empty, with trailing
    /// empty fields elided. The primary run is kept whole in the extended
    /// case so the two forms never collide.
    fn effective_fields<R: RawRecord + ?Sized>(&self, rec: &R) -> Vec<usize> {
        let all_empty = self.fields.iter().all(|&f| rec.raw(f).is_empty());
        let mut fields = self.fields.clone();
        let keep = if all_empty && !self.fields2.is_empty() {
            fields.extend_from_slice(&self.fields2);
            self.fields.len()
        } else {
            0
        };
        while fields.len() > keep && rec.raw(fields[fields.len() - 1]).is_empty() {
            fields.pop();
        }
        fields
    }

    /// Orders two records the way their encoded keys would order.
    pub fn compare<R: RawRecord + ?Sized>(&self, r1: &R, r2: &R) -> Ordering {
        if self.fields.len() == 1 && self.fields2.is_empty() {
            return r1.raw(self.fields[0]).cmp(r2.raw(self.fields[0]));
        }
        let f1 = self.effective_fields(r1);
        let f2 = self.effective_fields(r2);
        for i in 0..f1.len().min(f2.len()) {
            match r1.raw(f1[i]).cmp(r2.raw(f2[i])) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        f1.len().cmp(&f2.len())
    }
}

/// Incrementally composes a multi-field key.
pub struct Encoder {
    buf: Vec<u8>,
    fields: usize,
}

impl Default for Encoder {
    fn default() -> Self {
        Encoder::new()
    }
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            buf: Vec::new(),
            fields: 0,
        }
    }

    pub fn add(&mut self, field: &[u8]) {
        if self.fields > 0 {
            self.buf.extend_from_slice(&SEP);
        }
        for &b in field {
            if b == 0x00 {
                self.buf.extend_from_slice(&[0x00, 0x01]);
            } else {
                self.buf.push(b);
            }
        }
        self.fields += 1;
    }

    /// Returns the composed key and resets the encoder.
    pub fn finish(&mut self) -> Vec<u8> {
        self.fields = 0;
        std::mem::take(&mut self.buf)
    }
}
