// SPDX-License-Identifier: GPL-2.0

//! # CPU masks
//!
//! A [`Cpumask`] is a fixed-capacity bitmap over CPU ids, backed by a
//! `BitVec` of u64 words. Masks are value types; assignments copy.
//!
//! Masks are usually created from the kernel's cpulist notation
//! (`0-5,34,46-48`), either from a literal string or from the
//! `Cpus_allowed_list` line of a process's status file:
//!
//!```no_run
//!     use perflock_utils::{cpuset_of_pid, Cpumask};
//!     let mask = Cpumask::from_cpulist("0-3,8").unwrap();
//!     let init = cpuset_of_pid(1).unwrap();
//!     assert!(mask.and(&init).weight() <= mask.weight());
//!```

use std::fmt;
use std::fs;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;

/// Capacity of a [`Cpumask`] in bits. This matches the kernel's
/// compile-time maximum as exposed to userspace through `cpu_set_t`,
/// not the number of CPUs actually present on the host.
pub const NR_CPUS: usize = libc::CPU_SETSIZE as usize;

lazy_static::lazy_static! {
    /// The highest possible CPU id on this host plus one, per
    /// /sys/devices/system/cpu/possible. This may be smaller than the
    /// number of online CPUs would suggest on hosts with id gaps. Only
    /// used to trim diagnostic output; mask capacity is [`NR_CPUS`].
    pub static ref NR_CPU_IDS: usize = read_possible_cpus().unwrap_or(NR_CPUS);
}

fn read_possible_cpus() -> Result<usize> {
    let list = fs::read_to_string("/sys/devices/system/cpu/possible")?;
    let mask = Cpumask::from_cpulist(list.trim())?;
    Ok(mask.iter().last().map_or(NR_CPUS, |cpu| cpu + 1))
}

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= NR_CPUS {
            bail!("invalid CPU {} passed, max {}", cpu, NR_CPUS - 1);
        }

        Ok(())
    }

    /// Build a new empty Cpumask.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; NR_CPUS],
        }
    }

    /// Build a Cpumask from a Linux cpulist string such as `0-5,34,46-48`.
    ///
    /// Elements are decimal CPU ids or inclusive `lo-hi` ranges with
    /// `lo <= hi`. Whitespace is not accepted, an empty string is not
    /// accepted, and ids at or beyond [`NR_CPUS`] are rejected. Errors
    /// never yield a partially populated mask.
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        if cpulist.is_empty() {
            bail!("cannot parse empty cpulist");
        }

        let mut mask = Cpumask::new();
        for group in cpulist.split(',') {
            let (lo, hi) = match sscanf!(group, "{usize}-{usize}") {
                Ok((lo, hi)) => (lo, hi),
                Err(_) => match sscanf!(group, "{usize}") {
                    Ok(cpu) => (cpu, cpu),
                    Err(_) => bail!("failed to parse cpulist element {:?}", group),
                },
            };
            if lo > hi {
                bail!("invalid range {:?} ({} > {})", group, lo, hi);
            }
            if hi >= NR_CPUS {
                bail!("CPU {} in {:?} out of range, max {}", hi, group, NR_CPUS - 1);
            }
            for cpu in lo..=hi {
                mask.set_cpu(cpu)?;
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from raw u64 words, least significant word first.
    pub fn from_vec(words: Vec<u64>) -> Cpumask {
        let mut mask = BitVec::from_vec(words);
        mask.resize(NR_CPUS, false);
        Cpumask { mask }
    }

    /// Return the raw words backing the mask, least significant first.
    pub fn to_vec(&self) -> Vec<u64> {
        self.mask.as_raw_slice().to_vec()
    }

    /// Set a bit in the Cpumask. Returns an error if the CPU exceeds
    /// the mask capacity.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the CPU
    /// exceeds the mask capacity.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set. CPUs beyond the mask
    /// capacity read as false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// Create a Cpumask that is the AND of this Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= &other.mask;
        new
    }

    /// Create a Cpumask that is the OR of this Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= &other.mask;
        new
    }

    /// Create a Cpumask holding the bits of this Cpumask that are not
    /// set in `other`.
    pub fn difference(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= !other.mask.clone();
        new
    }

    /// Iterate over the set bit indices in increasing order.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    /// Render the mask in canonical cpulist form, ranges collapsed.
    pub fn to_cpulist(&self) -> String {
        let mut out = String::new();
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next != end + 1 {
                    break;
                }
                end = next;
                iter.next();
            }
            if !out.is_empty() {
                out.push(',');
            }
            if start == end {
                out.push_str(&start.to_string());
            } else {
                out.push_str(&format!("{}-{}", start, end));
            }
        }
        out
    }
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < NR_CPUS {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    /// Hex words covering the host's CPU id range, plus the popcount.
    /// Diagnostic output, not a wire format.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = (*NR_CPU_IDS).div_ceil(64).max(1);
        for word in self.mask.as_raw_slice().iter().take(words) {
            write!(f, "{:016x} ", word)?;
        }
        write!(f, "total: {}", self.weight())
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        self.mask |= &rhs.mask;
    }
}

/// Read the set of CPUs a process is allowed to run on from the
/// `Cpus_allowed_list` line of `/proc/<pid>/status`.
pub fn cpuset_of_pid(pid: u32) -> Result<Cpumask> {
    let path = format!("/proc/{}/status", pid);
    let status = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;

    const MARKER: &str = "Cpus_allowed_list:";
    let Some((_, rest)) = status.split_once(MARKER) else {
        bail!("did not find {:?} in {}", MARKER, path);
    };
    let Some((value, _)) = rest.split_once('\n') else {
        bail!("expected a newline after {:?} in {}", MARKER, path);
    };

    Cpumask::from_cpulist(value.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single() {
        let mask = Cpumask::from_cpulist("3").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn parse_comma() {
        let mask = Cpumask::from_cpulist("0,6").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 6]);
    }

    #[test]
    fn parse_range() {
        let mask = Cpumask::from_cpulist("0-2,6-8").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 6, 7, 8]);
    }

    #[test]
    fn parse_degenerate_range() {
        let mask = Cpumask::from_cpulist("5-5").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn parse_duplicates_idempotent() {
        let mask = Cpumask::from_cpulist("1,1,0-2,2").unwrap();
        assert_eq!(mask.weight(), 3);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(Cpumask::from_cpulist("").is_err());
    }

    #[test]
    fn parse_rejects_whitespace() {
        assert!(Cpumask::from_cpulist(" 3").is_err());
        assert!(Cpumask::from_cpulist("0, 2").is_err());
    }

    #[test]
    fn parse_rejects_reversed_range() {
        assert!(Cpumask::from_cpulist("5-2").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Cpumask::from_cpulist("a").is_err());
        assert!(Cpumask::from_cpulist("1-").is_err());
        assert!(Cpumask::from_cpulist("1,,2").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(Cpumask::from_cpulist(&format!("{}", NR_CPUS)).is_err());
        assert!(Cpumask::from_cpulist(&format!("0-{}", NR_CPUS)).is_err());
    }

    #[test]
    fn cpulist_round_trip() {
        for list in ["0", "0-5", "0-2,5,9-11", "1,3,5,7", "0-5,34,46-48"] {
            let mask = Cpumask::from_cpulist(list).unwrap();
            let emitted = mask.to_cpulist();
            assert_eq!(emitted, list);
            assert_eq!(Cpumask::from_cpulist(&emitted).unwrap(), mask);
        }
    }

    #[test]
    fn union_intersection_cardinality() {
        let a = Cpumask::from_cpulist("0-7").unwrap();
        let b = Cpumask::from_cpulist("4-11").unwrap();
        let union = a.or(&b);
        let inter = a.and(&b);
        assert_eq!(union.weight(), a.weight() + b.weight() - inter.weight());
        assert_eq!(union, b.or(&a));
        assert_eq!(inter, b.and(&a));
    }

    #[test]
    fn difference_disjoint_from_subtrahend() {
        let a = Cpumask::from_cpulist("0-7").unwrap();
        let b = Cpumask::from_cpulist("2-4,7").unwrap();
        let diff = a.difference(&b);
        assert!(diff.and(&b).is_empty());
        assert_eq!(diff.or(&b.and(&a)), a);
    }

    #[test]
    fn iter_ascending() {
        let mask = Cpumask::from_cpulist("9,1,5").unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 5, 9]);
    }

    #[test]
    fn words_round_trip() {
        let mask = Cpumask::from_cpulist("0,63,64,127").unwrap();
        assert_eq!(Cpumask::from_vec(mask.to_vec()), mask);
    }

    #[test]
    fn own_allowed_set_is_sane() {
        let mask = cpuset_of_pid(std::process::id()).unwrap();
        assert!(!mask.is_empty());
    }
}
