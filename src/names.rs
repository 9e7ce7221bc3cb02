use std::sync::OnceLock;

/// Curated pool of auto-generated display names. `getOrCreate` draws from
/// this pool and retries until it finds one not already in use (spec
/// §4.1). Kept as a flat static list the way the teacher keeps its demo
/// fixture lists (`demo_log`, `demo_producers`) — just data, no generator
/// crate pulled in for it.
fn pool() -> &'static [&'static str] {
    static POOL: OnceLock<Vec<&'static str>> = OnceLock::new();
    POOL.get_or_init(|| {
        vec![
            "Velvet Fox", "Neon Otter", "Brass Owl", "Quiet Comet", "Amber Wolf",
            "Lucky Sparrow", "Midnight Heron", "Copper Falcon", "Silver Magpie",
            "Golden Tiger", "Indigo Swan", "Crimson Lynx", "Azure Raven",
            "Scarlet Badger", "Cobalt Panther", "Emerald Dolphin", "Violet Crane",
            "Sapphire Bison", "Coral Osprey", "Ivory Wren", "Obsidian Hare",
            "Maroon Ibis", "Teal Puma", "Rusty Kestrel", "Pearl Jaguar",
            "Onyx Finch", "Frosted Lark", "Sunset Marlin", "Dusty Mongoose",
            "Electric Tapir", "Painted Gull", "Tidal Seal", "Rogue Marten",
            "Humble Stag", "Jolly Mackerel", "Stellar Egret", "Wandering Loris",
        ]
    })
}

/// Returns a pool entry that does not satisfy `is_taken`, retrying until one
/// is free. Falls back to a numbered suffix if the whole pool is exhausted
/// (practically unreachable at LAN-party scale, but keeps the function
/// total).
pub fn unique_default_name(mut is_taken: impl FnMut(&str) -> bool) -> String {
    let names = pool();
    let start = fastrand::usize(..names.len());
    for offset in 0..names.len() {
        let candidate = names[(start + offset) % names.len()];
        if !is_taken(candidate) {
            return candidate.to_string();
        }
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{} #{}", names[start], suffix);
        if !is_taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Whether `name` looks like an untouched auto-generated default, i.e.
/// exactly a pool entry or a pool entry with a "#<n>" disambiguator.
/// `getOrCreate` uses this to decide whether a `proposedName` is still
/// allowed to overwrite the stored name.
pub fn is_auto_generated(name: &str) -> bool {
    let base = name.split(" #").next().unwrap_or(name);
    pool().contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_avoids_taken() {
        let taken = ["Velvet Fox", "Neon Otter"];
        let name = unique_default_name(|n| taken.contains(&n));
        assert!(!taken.contains(&name.as_str()));
        assert!(is_auto_generated(&name));
    }

    #[test]
    fn detects_auto_generated_with_suffix() {
        assert!(is_auto_generated("Velvet Fox"));
        assert!(is_auto_generated("Velvet Fox #3"));
        assert!(!is_auto_generated("DJ Sparkle"));
    }
}
