// SPDX-License-Identifier: GPL-2.0

//! # Cpufreq policy adapter
//!
//! Each [`Domain`] wraps one kernel cpufreq policy directory
//! (`/sys/devices/system/cpu/cpufreq/policyN`), a group of CPUs whose
//! frequency range is set together. The daemon reads the configured and
//! hardware ranges and writes the scaling bounds; writing
//! `min == max == target` pins the domain to `target` where the driver
//! supports it.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use sscanf::sscanf;

use crate::misc::read_file_usize;
use crate::misc::write_file_usize;
use crate::Cpumask;

/// One cpufreq policy group. Frequencies are in kHz, as in sysfs.
#[derive(Debug, Clone)]
pub struct Domain {
    path: PathBuf,
    cpus: Cpumask,
}

impl Domain {
    fn new(path: PathBuf) -> Result<Domain> {
        let cpus_path = path.join("affected_cpus");
        let cpus_str =
            fs::read_to_string(&cpus_path).with_context(|| format!("reading {:?}", cpus_path))?;
        let mut cpus = Cpumask::new();
        for token in cpus_str.split_whitespace() {
            let cpu = token
                .parse::<usize>()
                .with_context(|| format!("parsing {:?} from {:?}", token, cpus_path))?;
            cpus.set_cpu(cpu)?;
        }

        Ok(Domain { path, cpus })
    }

    /// The CPUs governed by this policy.
    pub fn cpus(&self) -> &Cpumask {
        &self.cpus
    }

    /// The policy directory name, e.g. `policy0`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The currently configured scaling bounds, what the kernel will
    /// honour right now.
    pub fn current_range(&self) -> Result<(usize, usize)> {
        let min = read_file_usize(&self.path.join("scaling_min_freq"))?;
        let max = read_file_usize(&self.path.join("scaling_max_freq"))?;
        Ok((min, max))
    }

    /// The hardware range, plus the discrete frequency table if the
    /// driver publishes one (empty on continuous-scaling hardware).
    pub fn available_range(&self) -> Result<(usize, usize, Vec<usize>)> {
        let min = read_file_usize(&self.path.join("cpuinfo_min_freq"))?;
        let max = read_file_usize(&self.path.join("cpuinfo_max_freq"))?;

        let avail_path = self.path.join("scaling_available_frequencies");
        let avail = match fs::read_to_string(&avail_path) {
            Ok(list) => list
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<usize>()
                        .with_context(|| format!("parsing {:?} from {:?}", token, avail_path))
                })
                .collect::<Result<Vec<_>>>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("reading {:?}", avail_path)),
        };

        Ok((min, max, avail))
    }

    /// Write both scaling bounds.
    pub fn set_range(&self, min: usize, max: usize) -> Result<()> {
        write_file_usize(&self.path.join("scaling_min_freq"), min)?;
        write_file_usize(&self.path.join("scaling_max_freq"), max)?;
        Ok(())
    }
}

/// Enumerate all cpufreq policies on the host, ordered by policy index.
pub fn domains() -> Result<Vec<Domain>> {
    domains_in(Path::new("/"))
}

/// Enumerate cpufreq policies under an alternative filesystem root.
pub fn domains_in(root: &Path) -> Result<Vec<Domain>> {
    let pattern = root.join("sys/devices/system/cpu/cpufreq/policy[0-9]*");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 sysfs path {:?}", pattern))?;

    let mut found = Vec::new();
    for entry in glob(pattern).context("globbing cpufreq policies")? {
        let path = entry?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Ok(index) = sscanf!(name.as_str(), "policy{usize}") else {
            bail!("unexpected cpufreq policy directory {:?}", path);
        };
        found.push((index, Domain::new(path)?));
    }
    found.sort_by_key(|(index, _)| *index);

    Ok(found.into_iter().map(|(_, domain)| domain).collect())
}
