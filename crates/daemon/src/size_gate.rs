//! Size Gate Module
//!
//! Pre-download check that the delivered file will fit under the delivery
//! ceiling, with substitution or alternatives when it will not.

use crate::formats::FormatEntry;
use serde::{Deserialize, Serialize};

/// Estimated upload size of a format in bytes.
///
/// Exact filesize first, then the approximate filesize, then
/// `bitrate * duration / 8`. `None` when none of these are known.
pub fn estimate_size(entry: &FormatEntry, duration_secs: Option<f64>) -> Option<u64> {
    if let Some(size) = entry.filesize {
        return Some(size);
    }
    if let Some(size) = entry.filesize_approx {
        return Some(size);
    }
    match (entry.bitrate_kbps, duration_secs) {
        (Some(kbps), Some(secs)) if kbps > 0.0 && secs > 0.0 => {
            Some((kbps * 1000.0 * secs / 8.0) as u64)
        }
        _ => None,
    }
}

/// Combined estimate of the streams that will be merged into one file.
///
/// Unknown if any stream's size is unknown.
pub fn estimate_selection(entries: &[FormatEntry], duration_secs: Option<f64>) -> Option<u64> {
    if entries.is_empty() {
        return None;
    }
    entries
        .iter()
        .map(|e| estimate_size(e, duration_secs))
        .sum::<Option<u64>>()
}

/// A format that fits under the ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizedCandidate {
    pub format_id: String,
    pub estimated_bytes: u64,
    pub height: Option<u32>,
    pub muxed: bool,
}

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SizeDecision {
    /// Estimate is under the ceiling, or unknown.
    Fits { estimated_bytes: Option<u64> },
    /// Oversize; use this fitting candidate instead.
    Substitute {
        estimated_bytes: u64,
        candidate: SizedCandidate,
    },
    /// Oversize; offer these fitting candidates, best first.
    Alternatives {
        estimated_bytes: u64,
        candidates: Vec<SizedCandidate>,
    },
    /// Oversize and nothing fits.
    NoneFit { estimated_bytes: u64 },
}

impl SizeDecision {
    pub fn is_oversize(&self) -> bool {
        !matches!(self, SizeDecision::Fits { .. })
    }
}

/// Fitting candidates ranked best first.
///
/// Muxed formats outrank single-stream ones; within a group, larger wins.
/// Audio-only formats are only candidates for an audio request. A video-only
/// format is downloaded merged with the best audio track, so it is sized
/// together with the largest audio-only estimate, and skipped when the audio
/// that would be added cannot be sized.
pub fn rank_candidates(
    formats: &[FormatEntry],
    duration_secs: Option<f64>,
    max_bytes: u64,
    audio_only: bool,
) -> Vec<SizedCandidate> {
    let audio_tracks: Vec<Option<u64>> = formats
        .iter()
        .filter(|f| !f.is_mhtml && f.is_audio_only())
        .map(|f| estimate_size(f, duration_secs))
        .collect();
    let merged_audio = if audio_tracks.is_empty() {
        Some(0)
    } else {
        audio_tracks.iter().copied().flatten().max()
    };

    let mut candidates: Vec<SizedCandidate> = formats
        .iter()
        .filter(|f| !f.is_mhtml)
        .filter(|f| if audio_only { f.has_audio } else { f.has_video })
        .filter_map(|f| {
            let mut bytes = estimate_size(f, duration_secs)?;
            if !audio_only && f.is_video_only() {
                bytes = bytes.checked_add(merged_audio?)?;
            }
            (bytes < max_bytes).then(|| SizedCandidate {
                format_id: f.id.clone(),
                estimated_bytes: bytes,
                height: f.height,
                muxed: f.is_muxed(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        let pref = |c: &SizedCandidate| if audio_only { !c.muxed } else { c.muxed };
        pref(b)
            .cmp(&pref(a))
            .then(b.estimated_bytes.cmp(&a.estimated_bytes))
    });
    candidates
}

/// Check the chosen selection against the delivery ceiling.
///
/// # Arguments
/// * `selected` - Streams that will be merged for the current choice
/// * `formats` - Every format the media offers
/// * `duration_secs` - Media duration, for bitrate-based estimates
/// * `max_bytes` - Delivery ceiling; an estimate equal to it is oversize
/// * `allow_substitution` - Swap in the best fit instead of listing alternatives
/// * `alternatives_limit` - Maximum alternatives to list
/// * `audio_only` - Rank audio formats instead of video formats
#[allow(clippy::too_many_arguments)]
pub fn check_size_gate(
    selected: &[FormatEntry],
    formats: &[FormatEntry],
    duration_secs: Option<f64>,
    max_bytes: u64,
    allow_substitution: bool,
    alternatives_limit: usize,
    audio_only: bool,
) -> SizeDecision {
    let estimated = estimate_selection(selected, duration_secs);
    let estimated_bytes = match estimated {
        Some(bytes) if bytes >= max_bytes => bytes,
        _ => return SizeDecision::Fits { estimated_bytes: estimated },
    };

    let mut candidates = rank_candidates(formats, duration_secs, max_bytes, audio_only);
    if candidates.is_empty() {
        return SizeDecision::NoneFit { estimated_bytes };
    }

    if allow_substitution {
        SizeDecision::Substitute {
            estimated_bytes,
            candidate: candidates.remove(0),
        }
    } else {
        candidates.truncate(alternatives_limit.max(1));
        SizeDecision::Alternatives {
            estimated_bytes,
            candidates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::RawFormat;
    use proptest::prelude::*;

    const MB: f64 = 1_000_000.0;
    const GIB: u64 = 2 * 1024 * 1024 * 1024;

    fn muxed(id: &str, bytes: f64) -> FormatEntry {
        FormatEntry::from_raw(&RawFormat {
            format_id: id.to_string(),
            ext: Some("mp4".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some("mp4a.40.2".to_string()),
            filesize: Some(bytes),
            ..RawFormat::default()
        })
    }

    fn video_only(id: &str, bytes: f64) -> FormatEntry {
        FormatEntry::from_raw(&RawFormat {
            format_id: id.to_string(),
            ext: Some("mp4".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some("none".to_string()),
            filesize: Some(bytes),
            ..RawFormat::default()
        })
    }

    #[test]
    fn test_estimate_prefers_exact_then_approx_then_bitrate() {
        let mut entry = FormatEntry::from_raw(&RawFormat {
            format_id: "x".into(),
            filesize: Some(100.0),
            filesize_approx: Some(200.0),
            tbr: Some(8.0),
            ..RawFormat::default()
        });
        assert_eq!(estimate_size(&entry, Some(10.0)), Some(100));
        entry.filesize = None;
        assert_eq!(estimate_size(&entry, Some(10.0)), Some(200));
        entry.filesize_approx = None;
        // 8 kbit/s for 10 s = 10_000 bytes
        assert_eq!(estimate_size(&entry, Some(10.0)), Some(10_000));
        assert_eq!(estimate_size(&entry, None), None);
    }

    #[test]
    fn test_picks_largest_fitting_muxed_candidate() {
        let formats = vec![
            muxed("small", 500.0 * MB),
            muxed("medium", 1500.0 * MB),
            muxed("large", 2500.0 * MB),
        ];
        let selected = vec![formats[2].clone()];

        let decision = check_size_gate(&selected, &formats, None, 2_000_000_000, true, 3, false);

        match decision {
            SizeDecision::Substitute { candidate, estimated_bytes } => {
                assert_eq!(candidate.format_id, "medium");
                assert_eq!(estimated_bytes, 2_500_000_000);
            }
            other => panic!("expected substitution, got {other:?}"),
        }
    }

    #[test]
    fn test_muxed_outranks_larger_video_only() {
        let formats = vec![video_only("v", 1800.0 * MB), muxed("m", 900.0 * MB)];
        let ranked = rank_candidates(&formats, None, GIB, false);
        assert_eq!(ranked[0].format_id, "m");
        assert_eq!(ranked[1].format_id, "v");
    }

    fn audio(id: &str, bytes: f64) -> FormatEntry {
        FormatEntry::from_raw(&RawFormat {
            format_id: id.to_string(),
            ext: Some("m4a".to_string()),
            vcodec: Some("none".to_string()),
            acodec: Some("mp4a.40.2".to_string()),
            filesize: Some(bytes),
            ..RawFormat::default()
        })
    }

    #[test]
    fn test_video_only_substitute_includes_merged_audio() {
        let formats = vec![
            video_only("137", 2300.0 * MB),
            video_only("136", 2000.0 * MB),
            video_only("135", 1500.0 * MB),
            audio("140", 300.0 * MB),
        ];
        let selected = vec![formats[0].clone(), formats[3].clone()];

        let decision = check_size_gate(&selected, &formats, None, GIB, true, 3, false);

        match decision {
            SizeDecision::Substitute { candidate, .. } => {
                assert_eq!(candidate.format_id, "135");
                assert_eq!(candidate.estimated_bytes, 1_800_000_000);
            }
            other => panic!("expected substitution, got {other:?}"),
        }
    }

    #[test]
    fn test_video_only_with_unsized_audio_is_not_offered() {
        let r#unsized = FormatEntry::from_raw(&RawFormat {
            format_id: "a".into(),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            ..RawFormat::default()
        });
        let formats = vec![video_only("v", 500.0 * MB), r#unsized];
        assert!(rank_candidates(&formats, None, GIB, false).is_empty());
    }

    #[test]
    fn test_explicit_pick_gets_alternatives() {
        let formats = vec![
            muxed("a", 100.0 * MB),
            muxed("b", 300.0 * MB),
            muxed("c", 700.0 * MB),
            muxed("d", 900.0 * MB),
            muxed("huge", 3000.0 * MB),
        ];
        let decision = check_size_gate(&formats[4..], &formats, None, GIB, false, 3, false);
        match decision {
            SizeDecision::Alternatives { candidates, .. } => {
                let ids: Vec<&str> = candidates.iter().map(|c| c.format_id.as_str()).collect();
                assert_eq!(ids, vec!["d", "c", "b"]);
            }
            other => panic!("expected alternatives, got {other:?}"),
        }
    }

    #[test]
    fn test_estimate_equal_to_ceiling_is_oversize() {
        let formats = vec![muxed("exact", GIB as f64)];
        let decision = check_size_gate(&formats, &formats, None, GIB, true, 3, false);
        assert_eq!(decision, SizeDecision::NoneFit { estimated_bytes: GIB });
    }

    #[test]
    fn test_unknown_size_fits() {
        let unknown = FormatEntry::from_raw(&RawFormat {
            format_id: "u".into(),
            ..RawFormat::default()
        });
        let decision = check_size_gate(&[unknown.clone()], &[unknown], None, GIB, true, 3, false);
        assert_eq!(decision, SizeDecision::Fits { estimated_bytes: None });
    }

    #[test]
    fn test_merged_streams_are_summed() {
        let v = video_only("v", 1200.0 * MB);
        let a = FormatEntry::from_raw(&RawFormat {
            format_id: "a".into(),
            vcodec: Some("none".into()),
            acodec: Some("opus".into()),
            filesize: Some(1000.0 * MB),
            ..RawFormat::default()
        });
        assert_eq!(estimate_selection(&[v.clone(), a.clone()], None), Some(2_200_000_000));
        assert!(check_size_gate(&[v, a], &[], None, 2_000_000_000, true, 3, false).is_oversize());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Whatever is substituted or offered is strictly under the ceiling,
        // and a fitting selection is never reported oversize.
        #[test]
        fn prop_never_offers_oversize(
            sizes in prop::collection::vec(1u64..5_000, 1..12),
            pick in any::<prop::sample::Index>(),
            ceiling in 1u64..5_000,
            substitute in any::<bool>(),
        ) {
            let formats: Vec<FormatEntry> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| muxed(&format!("f{}", i), *s as f64))
                .collect();
            let selected = vec![formats[pick.index(formats.len())].clone()];
            let selected_size = selected[0].filesize.unwrap();

            let decision = check_size_gate(&selected, &formats, None, ceiling, substitute, 3, false);
            match decision {
                SizeDecision::Fits { .. } => prop_assert!(selected_size < ceiling),
                SizeDecision::Substitute { candidate, .. } => {
                    prop_assert!(candidate.estimated_bytes < ceiling);
                    let best = sizes.iter().copied().filter(|s| *s < ceiling).max().unwrap();
                    prop_assert_eq!(candidate.estimated_bytes, best);
                }
                SizeDecision::Alternatives { candidates, .. } => {
                    prop_assert!(!candidates.is_empty() && candidates.len() <= 3);
                    prop_assert!(candidates.iter().all(|c| c.estimated_bytes < ceiling));
                }
                SizeDecision::NoneFit { .. } => {
                    prop_assert!(sizes.iter().all(|s| *s >= ceiling));
                }
            }
        }
    }
}
