// SPDX-License-Identifier: GPL-2.0

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

/// Read a whitespace-trimmed unsigned integer from a file, the format
/// of most single-value sysfs attributes.
pub fn read_file_usize(path: &Path) -> Result<usize> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    match val.trim().parse::<usize>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => {
            bail!("Failed to parse {}", val);
        }
    }
}

/// Write an unsigned integer to a file, sysfs style.
pub fn write_file_usize(path: &Path, val: usize) -> Result<()> {
    let mut file = File::create(path).with_context(|| format!("opening {:?}", path))?;
    write!(file, "{}", val).with_context(|| format!("writing {} to {:?}", val, path))
}
