use amora_types::models::{MediaAsset, MediaSeen};
use rand::Rng;
use rand::seq::IndexedRandom;

/// Pick a reply asset of one modality.
///
/// The most recently shown asset is skipped unless it is the only one. If any
/// tag matches (case-insensitive substring of description or tags) the choice
/// is restricted to matching assets. The final pick is uniform.
pub fn select_asset<'a, R: Rng + ?Sized>(
    assets: &'a [MediaAsset],
    tags: &[String],
    seen: &MediaSeen,
    rng: &mut R,
) -> Option<&'a MediaAsset> {
    let first = assets.first()?;
    let last_shown = seen.most_recent(first.kind);

    let fresh: Vec<&MediaAsset> = assets
        .iter()
        .filter(|a| Some(a.media_key.as_str()) != last_shown)
        .collect();
    let pool: Vec<&MediaAsset> = if fresh.is_empty() {
        assets.iter().collect()
    } else {
        fresh
    };

    let needles: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let tagged: Vec<&MediaAsset> = if needles.is_empty() {
        Vec::new()
    } else {
        pool.iter()
            .copied()
            .filter(|a| {
                let haystack = format!("{} {}", a.description, a.tags).to_lowercase();
                needles.iter().any(|n| haystack.contains(n.as_str()))
            })
            .collect()
    };

    let candidates = if tagged.is_empty() { pool } else { tagged };
    candidates.choose(rng).copied()
}
