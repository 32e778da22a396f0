//! Composite and column-name framing
//!
//! A composite is a sequence of components, each serialized as a 16-bit
//! length, the component bytes, and an end-of-component marker byte. All
//! markers are zero except possibly the trailing one, which may flag a
//! range boundary. Clustering keys travel through the encoder in composite
//! form; column names are framed by appending further components to the
//! clustering prefix.

use bytes::Bytes;

use crate::encoding::narrow_u16;
use crate::error::Result;

/// End-of-component marker carried by the final byte of a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMarker {
    /// Start of a clustering range
    StartRange,
    /// Not a range boundary
    None,
    /// End of a clustering range
    EndRange,
}

impl CompositeMarker {
    fn byte(self) -> u8 {
        match self {
            CompositeMarker::StartRange => (-1i8) as u8,
            CompositeMarker::None => 0,
            CompositeMarker::EndRange => 1,
        }
    }
}

/// A clustering prefix in composite form.
///
/// Retains its component values alongside the serialized bytes so the
/// column-name statistics trackers can compare component-wise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composite {
    bytes: Vec<u8>,
    components: Vec<Bytes>,
    is_static: bool,
}

impl Composite {
    /// Compose a clustering key. An empty value list serializes to nothing:
    /// there is no clustering key.
    pub fn from_clustering(values: &[Bytes]) -> Result<Self> {
        let bytes = if values.is_empty() {
            Vec::new()
        } else {
            serialize_exploded(values, CompositeMarker::None)?
        };
        Ok(Self {
            bytes,
            components: values.to_vec(),
            is_static: false,
        })
    }

    /// The prefix shared by every static-row cell: the two-byte static
    /// marker, carrying no components and no trailing marker of its own.
    pub fn static_prefix() -> Self {
        Self {
            bytes: vec![0xFF, 0xFF],
            components: Vec::new(),
            is_static: true,
        }
    }

    /// Serialized form.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The component values this composite was built from.
    pub fn components(&self) -> &[Bytes] {
        &self.components
    }

    /// Whether this is the static-row prefix.
    pub fn is_static(&self) -> bool {
        self.is_static
    }
}

/// Serialize a component list with the trailing end-of-component marker.
/// An empty list serializes to the bare marker byte.
pub fn serialize_exploded(values: &[Bytes], marker: CompositeMarker) -> Result<Vec<u8>> {
    if values.is_empty() {
        return Ok(vec![marker.byte()]);
    }
    let mut out = Vec::new();
    for (i, value) in values.iter().enumerate() {
        out.extend_from_slice(&narrow_u16(value.len())?.to_be_bytes());
        out.extend_from_slice(value);
        let last = i + 1 == values.len();
        out.push(if last { marker.byte() } else { 0 });
    }
    Ok(out)
}

/// Frame a column name in a compound schema: a 16-bit total size, the
/// clustering-key bytes, then the appended components. The appended
/// composite carries the trailing marker; when it is nothing but that
/// marker, the clustering key's own trailing marker byte is dropped so the
/// marker is not doubled.
pub(crate) fn compose_column_name(
    clustering: &Composite,
    values: &[Bytes],
    marker: CompositeMarker,
) -> Result<Vec<u8>> {
    let appended = serialize_exploded(values, marker)?;
    let mut prefix = clustering.bytes().to_vec();
    if appended.len() == 1 && !clustering.is_static() && !prefix.is_empty() {
        prefix.pop();
    }
    let total = narrow_u16(prefix.len() + appended.len())?;
    let mut out = Vec::with_capacity(2 + total as usize);
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&appended);
    Ok(out)
}

/// Frame a column name in a non-compound schema: a 16-bit size and the
/// name bytes.
pub(crate) fn compose_plain_column_name(name: &[u8]) -> Result<Vec<u8>> {
    let size = narrow_u16(name.len())?;
    let mut out = Vec::with_capacity(2 + name.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(name);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_clustering_serialization() {
        let ck = Composite::from_clustering(&[b(&[0, 0, 0, 1])]).unwrap();
        assert_eq!(ck.bytes(), &[0x00, 0x04, 0, 0, 0, 1, 0x00]);

        let ck = Composite::from_clustering(&[b(b"a"), b(b"bc")]).unwrap();
        assert_eq!(
            ck.bytes(),
            &[0x00, 0x01, b'a', 0x00, 0x00, 0x02, b'b', b'c', 0x00]
        );

        let ck = Composite::from_clustering(&[]).unwrap();
        assert!(ck.bytes().is_empty());
    }

    #[test]
    fn test_column_name_appends_component() {
        let ck = Composite::from_clustering(&[b(b"k")]).unwrap();
        let name = compose_column_name(&ck, &[b(b"v")], CompositeMarker::None).unwrap();
        // size 8 = clustering (2+1+1) + name component (2+1+1)
        assert_eq!(
            name,
            vec![0x00, 0x08, 0x00, 0x01, b'k', 0x00, 0x00, 0x01, b'v', 0x00]
        );
    }

    #[test]
    fn test_bare_marker_replaces_trailing_byte() {
        let ck = Composite::from_clustering(&[b(b"k")]).unwrap();
        let name = compose_column_name(&ck, &[], CompositeMarker::StartRange).unwrap();
        // clustering loses its 0x00 end-of-component byte; the marker takes its place
        assert_eq!(name, vec![0x00, 0x04, 0x00, 0x01, b'k', 0xFF]);

        let name = compose_column_name(&ck, &[], CompositeMarker::EndRange).unwrap();
        assert_eq!(name, vec![0x00, 0x04, 0x00, 0x01, b'k', 0x01]);
    }

    #[test]
    fn test_row_marker_keeps_empty_component() {
        let ck = Composite::from_clustering(&[b(b"k")]).unwrap();
        let name = compose_column_name(&ck, &[Bytes::new()], CompositeMarker::None).unwrap();
        // the empty component serializes to its own length and marker bytes
        assert_eq!(
            name,
            vec![0x00, 0x07, 0x00, 0x01, b'k', 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_static_prefix_framing() {
        let sp = Composite::static_prefix();
        let name = compose_column_name(&sp, &[b(b"s")], CompositeMarker::None).unwrap();
        assert_eq!(name, vec![0x00, 0x06, 0xFF, 0xFF, 0x00, 0x01, b's', 0x00]);
    }

    #[test]
    fn test_plain_column_name() {
        let name = compose_plain_column_name(b"v").unwrap();
        assert_eq!(name, vec![0x00, 0x01, b'v']);
    }
}
