#![no_main]

use libfuzzer_sys::fuzz_target;
use loghouse_storage::DictBlockReader;

fuzz_target!(|data: &[u8]| {
    // The first two bytes pick the block's record count, the rest is the
    // packed dictionary. Malformed input must fail cleanly.
    if data.len() < 2 {
        return;
    }
    let rec_count = u16::from_le_bytes([data[0], data[1]]);

    let mut reader = DictBlockReader::new();
    if reader.read_dict_enc(&data[2..], rec_count).is_ok() {
        assert_eq!(reader.rec_to_word().len(), rec_count as usize);
        for rec in 0..rec_count {
            let _ = reader.word_for_record(rec);
        }
    }
});
