//! Per-column encode buffer of a WIP block.

use loghouse_core::BufferPool;

use crate::dict::DictEncoder;

/// Concatenated TLV values of one column, one per block record, plus the
/// column's dictionary.
#[derive(Debug)]
pub struct ColWip {
    pub(crate) buf: Vec<u8>,
    pub(crate) last_record_start: usize,
    pub(crate) dict: DictEncoder,
}

impl ColWip {
    pub fn new(buf: Vec<u8>, dict_ceiling: u16) -> Self {
        Self {
            buf,
            last_record_start: 0,
            dict: DictEncoder::new(dict_ceiling),
        }
    }

    pub fn from_pool(pool: &BufferPool, dict_ceiling: u16) -> Self {
        Self::new(pool.get(), dict_ceiling)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Encoded value of the record written last.
    pub fn last_record(&self) -> &[u8] {
        &self.buf[self.last_record_start..]
    }

    pub fn dict(&self) -> &DictEncoder {
        &self.dict
    }

    /// Mark the start of the next record's value.
    pub(crate) fn start_record(&mut self) {
        self.last_record_start = self.buf.len();
    }

    /// Write the packed dictionary form of the block into `out`.
    pub(crate) fn pack_dict_into(&self, out: &mut Vec<u8>) {
        out.clear();
        self.dict.pack(out);
    }

    /// Empty the buffer and dictionary for the next block, keeping capacity.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.last_record_start = 0;
        self.dict.clear();
    }

    /// Give the buffer back to the pool.
    pub(crate) fn release(self, pool: &BufferPool) {
        pool.put(self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loghouse_core::{encode_backfill, encode_str};

    #[test]
    fn test_last_record_tracks_latest_value() {
        let mut cw = ColWip::new(Vec::new(), 501);
        cw.start_record();
        encode_str(&mut cw.buf, b"first").unwrap();
        cw.start_record();
        encode_backfill(&mut cw.buf);
        assert_eq!(cw.last_record(), &[0x13]);
        assert_eq!(cw.len(), 8 + 1);
    }

    #[test]
    fn test_reset_clears_buffer_and_dict() {
        let mut cw = ColWip::new(Vec::new(), 501);
        cw.start_record();
        encode_str(&mut cw.buf, b"v").unwrap();
        let tlv = cw.last_record().to_vec();
        cw.dict.check_add_dict_entry(&tlv, 0);
        cw.reset();
        assert!(cw.is_empty());
        assert_eq!(cw.dict().count(), 0);
    }

    #[test]
    fn test_pack_dict_into_buffer() {
        let mut cw = ColWip::new(Vec::new(), 501);
        for rec in 0..3u16 {
            cw.start_record();
            encode_str(&mut cw.buf, b"same").unwrap();
            let tlv = cw.last_record().to_vec();
            cw.dict.check_add_dict_entry(&tlv, rec);
        }
        let mut packed = vec![0xff];
        cw.pack_dict_into(&mut packed);
        // [1 word][7 byte tlv][3 recs][0][1][2]
        assert_eq!(packed.len(), 2 + 7 + 2 + 6);
        assert_eq!(&packed[..2], &[1, 0]);
        assert_eq!(cw.len(), 3 * 7);
    }
}
