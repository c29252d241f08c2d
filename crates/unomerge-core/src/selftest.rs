use crate::collision;
use crate::error::Error;
use crate::metadata;
use crate::provenance;
use crate::taxonomy::{Origin, Route, TaxonomyMap};
use csv::ReaderBuilder;
use std::path::Path;
use tracing::info;

/// Lightweight syntactic self-check. Touches no volume and needs no
/// privilege: in-memory CSV round-trip, suffix fixed-point property,
/// taxonomy sanity, and FILETIME conversion spot values.
pub fn run_self_test() -> Result<(), Error> {
    csv_round_trip()?;
    suffix_fixed_points()?;
    taxonomy_sanity()?;
    filetime_spot_values()?;
    info!("Self-test passed");
    Ok(())
}

fn fail(check: &str, detail: String) -> Error {
    Error::Other(format!("self-test {check} failed: {detail}"))
}

fn csv_round_trip() -> Result<(), Error> {
    let awkward = [
        "plain",
        "with,comma",
        "with \"quotes\"",
        "with\nnewline",
        "  leading and trailing  ",
    ];
    let rendered = provenance::render_record(&awkward)?;

    // Whitespace-padded fields must come back quoted, so trimming readers
    // cannot mangle them.
    if !String::from_utf8_lossy(&rendered).contains("\"  leading and trailing  \"") {
        return Err(fail("csv", "padded field left unquoted".to_string()));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .from_reader(rendered.as_slice());
    let record = reader
        .records()
        .next()
        .ok_or_else(|| fail("csv", "no record read back".to_string()))??;
    for (expected, got) in awkward.iter().zip(record.iter()) {
        if expected != &got {
            return Err(fail("csv", format!("{expected:?} became {got:?}")));
        }
    }
    Ok(())
}

fn suffix_fixed_points() -> Result<(), Error> {
    let cases = [
        ("p.jpg", Origin::Unoe, "p__UNOE.jpg"),
        ("p__UNOE.jpg", Origin::Dose, "p__UNOE.jpg"),
        ("p__DOSE_3.jpg", Origin::Unoe, "p__DOSE_3.jpg"),
        ("p__UNOEx.jpg", Origin::Dose, "p__UNOEx__DOSE.jpg"),
    ];
    for (input, origin, expected) in cases {
        let got = collision::suffixed_path(Path::new(input), origin);
        if got != Path::new(expected) {
            return Err(fail(
                "suffix",
                format!("{input} + {origin} gave {}", got.display()),
            ));
        }
    }
    Ok(())
}

fn taxonomy_sanity() -> Result<(), Error> {
    let map = TaxonomyMap::standard();
    for (name, dest) in map.shared_buckets() {
        if dest.is_absolute() || dest.components().any(|c| c.as_os_str() == "..") {
            return Err(fail(
                "taxonomy",
                format!("bucket {name} escapes the destination: {}", dest.display()),
            ));
        }
    }
    match map.classify_top_level_dir(Origin::Unoe, "$RECYCLE.BIN") {
        Route::Excluded => Ok(()),
        other => Err(fail("taxonomy", format!("$RECYCLE.BIN routed as {other:?}"))),
    }
}

fn filetime_spot_values() -> Result<(), Error> {
    // 2009-02-13T23:31:30Z, encoded plain and 0x-prefixed.
    let ticks = (1_234_567_890u64 + 11_644_473_600) * 10_000_000;
    for encoded in [format!("{ticks:016x}"), format!("0x{ticks:016x}")] {
        match metadata::parse_filetime_hex(encoded.as_bytes()) {
            Some(1_234_567_890) => {}
            other => return Err(fail("filetime", format!("{encoded} gave {other:?}"))),
        }
    }
    if metadata::format_epoch_utc(1_234_567_890) != "2009-02-13T23:31:30Z" {
        return Err(fail("filetime", "epoch formatting drifted".to_string()));
    }
    if metadata::parse_filetime_hex(b"garbage").is_some() {
        return Err(fail("filetime", "garbage decoded".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_passes() {
        run_self_test().unwrap();
    }
}
