//! Cache hierarchy sizes used to size macro blocks.
//!
//! Detected once via CPUID leaf 4 (x86_64) or sysfs (Linux) and cached in a
//! static `OnceLock`. Callers may override them per convolution.

use std::sync::OnceLock;

const FALLBACK: CacheSizes = CacheSizes {
    l1: 32 * 1024,
    l2: 512 * 1024,
    l3: 8 * 1024 * 1024,
};

/// Data cache capacities in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheSizes {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self::get()
    }
}

impl CacheSizes {
    pub fn new(l1: usize, l2: usize, l3: usize) -> Self {
        Self {
            l1: l1.max(1),
            l2: l2.max(1),
            l3: l3.max(1),
        }
    }

    /// Detected sizes of the current machine, computed once.
    pub fn get() -> Self {
        static SIZES: OnceLock<CacheSizes> = OnceLock::new();
        *SIZES.get_or_init(|| {
            let sizes = detect();
            log::debug!(
                "cache sizes: L1 {} KiB, L2 {} KiB, L3 {} KiB",
                sizes.l1 / 1024,
                sizes.l2 / 1024,
                sizes.l3 / 1024
            );
            sizes
        })
    }

    pub fn fallback() -> Self {
        FALLBACK
    }
}

fn detect() -> CacheSizes {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(sizes) = detect_x86() {
            return sizes;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(sizes) = detect_sysfs() {
            return sizes;
        }
    }
    FALLBACK
}

#[cfg(target_arch = "x86_64")]
fn detect_x86() -> Option<CacheSizes> {
    let mut l1 = None;
    let mut l2 = None;
    let mut l3 = None;
    for sub in 0..16u32 {
        // `__cpuid_count` is a safe fn on newer toolchains
        #[allow(unused_unsafe)]
        let info = unsafe { std::arch::x86_64::__cpuid_count(4, sub) };
        let cache_type = info.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        let line = (info.ebx & 0xFFF) as usize + 1;
        let partitions = ((info.ebx >> 12) & 0x3FF) as usize + 1;
        let ways = ((info.ebx >> 22) & 0x3FF) as usize + 1;
        let sets = info.ecx as usize + 1;
        let size = line * partitions * ways * sets;
        match (level, cache_type) {
            (1, 1) => l1 = Some(size),
            (2, 2) | (2, 3) => l2 = Some(size),
            (3, 2) | (3, 3) => l3 = Some(size),
            _ => {}
        }
    }
    match (l1, l2) {
        (Some(l1), Some(l2)) => Some(CacheSizes::new(l1, l2, l3.unwrap_or(FALLBACK.l3))),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn detect_sysfs() -> Option<CacheSizes> {
    let mut l1 = None;
    let mut l2 = None;
    let mut l3 = None;
    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let read = |name: &str| std::fs::read_to_string(format!("{base}/{name}")).ok();
        let (Some(level), Some(kind), Some(size)) = (read("level"), read("type"), read("size"))
        else {
            continue;
        };
        let Some(size) = parse_size(size.trim()) else {
            continue;
        };
        match (level.trim(), kind.trim()) {
            ("1", "Data") => l1 = Some(size),
            ("2", "Unified") => l2 = Some(size),
            ("3", "Unified") => l3 = Some(size),
            _ => {}
        }
    }
    match (l1, l2) {
        (Some(l1), Some(l2)) => Some(CacheSizes::new(l1, l2, l3.unwrap_or(FALLBACK.l3))),
        _ => None,
    }
}

#[cfg(any(target_os = "linux", test))]
fn parse_size(text: &str) -> Option<usize> {
    if let Some(kb) = text.strip_suffix('K') {
        kb.parse::<usize>().ok().map(|v| v * 1024)
    } else if let Some(mb) = text.strip_suffix('M') {
        mb.parse::<usize>().ok().map(|v| v * 1024 * 1024)
    } else {
        text.parse().ok()
    }
}
