#![no_main]

use formula_xls_records::{
    load_workbook_stream, workbook_stream_to_vec, LoadOptions, SaveError, SaveOptions,
};
use libfuzzer_sys::fuzz_target;

/// Keep the harness itself bounded: continuation merging can grow one logical record up to the
/// configured cap, so keep inputs well below it.
const MAX_INPUT_BYTES: usize = 256 * 1024;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > MAX_INPUT_BYTES {
        return;
    }

    let options = LoadOptions {
        max_logical_record_bytes: 1024 * 1024,
        max_diagnostics: 64,
        ..LoadOptions::defensive()
    };
    let Ok(mut loaded) = load_workbook_stream(data, &options) else {
        return;
    };

    // Anything that loads must save (short of an unencodable derived record), and the saved
    // stream must load again.
    match workbook_stream_to_vec(&mut loaded.graph, &SaveOptions::default()) {
        Ok(saved) => {
            if let Err(err) = load_workbook_stream(&saved[..], &options) {
                panic!("saved stream failed to reload: {err}");
            }
        }
        Err(SaveError::Finalize { .. }) => {}
        Err(err) => panic!("loaded graph failed to save: {err}"),
    }
});
