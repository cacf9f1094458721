//! Multimodal tag extraction
//!
//! Hosts embed media references inline as `<img>path</img>` and
//! `<audio>path</audio>`. This module rewrites such text into a
//! template with synthetic placeholders plus a lookup of media parts,
//! so the rest of the pipeline never re-parses tags.

use std::collections::HashMap;
use std::path::PathBuf;

/// Default edge length for images whose tags carry no size information.
/// Engines that derive their own input resolution may ignore it.
pub const DEFAULT_IMAGE_EDGE: u32 = 448;

/// Media kinds recognized by the extractor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

impl MediaKind {
    /// Prefix used when generating placeholder names for this kind
    fn placeholder_prefix(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
        }
    }
}

/// An extracted image reference
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePart {
    /// Path to the image file
    pub source: PathBuf,
    /// Requested input width in pixels
    pub width: u32,
    /// Requested input height in pixels
    pub height: u32,
}

/// An extracted audio reference
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPart {
    /// Path to the audio file
    pub file_path: PathBuf,
}

/// A prompt rewritten with placeholders plus the media they stand for.
///
/// Every placeholder appearing in `template` has exactly one entry in
/// `images` or `audios`; placeholder names are unique and allocated in
/// first-seen order per kind (`image_0`, `image_1`, ... / `audio_0`, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultimodalPrompt {
    /// The input text with each matched tag span replaced by a placeholder
    pub template: String,
    /// Placeholder name -> image part
    pub images: HashMap<String, ImagePart>,
    /// Placeholder name -> audio part
    pub audios: HashMap<String, AudioPart>,
}

impl MultimodalPrompt {
    /// Whether any media references were extracted
    pub fn is_multimodal(&self) -> bool {
        !self.images.is_empty() || !self.audios.is_empty()
    }
}

/// A delimited region the extractor recognizes
struct DelimiterRule {
    open: &'static str,
    close: &'static str,
    kind: MediaKind,
}

const RULES: &[DelimiterRule] = &[
    DelimiterRule {
        open: "<img>",
        close: "</img>",
        kind: MediaKind::Image,
    },
    DelimiterRule {
        open: "<audio>",
        close: "</audio>",
        kind: MediaKind::Audio,
    },
];

/// Scan `raw` left-to-right for non-overlapping delimited regions and
/// replace each matched region with whatever the placeholder factory
/// returns for it. An opening delimiter with no matching close is left
/// untouched. No nesting: the close is matched textually, greedily
/// from just past the open.
fn extract_regions<F>(raw: &str, rules: &[DelimiterRule], mut placeholder_for: F) -> String
where
    F: FnMut(MediaKind, &str) -> String,
{
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    loop {
        // Earliest opening delimiter of any kind wins
        let next = rules
            .iter()
            .filter_map(|r| rest.find(r.open).map(|pos| (pos, r)))
            .min_by_key(|(pos, _)| *pos);

        let Some((pos, rule)) = next else {
            out.push_str(rest);
            break;
        };

        out.push_str(&rest[..pos]);
        let after_open = &rest[pos + rule.open.len()..];

        match after_open.find(rule.close) {
            Some(close_pos) => {
                let inner = &after_open[..close_pos];
                out.push_str(&placeholder_for(rule.kind, inner));
                rest = &after_open[close_pos + rule.close.len()..];
            }
            None => {
                // Unmatched open tag: keep it verbatim, keep scanning past it
                out.push_str(rule.open);
                rest = after_open;
            }
        }
    }

    out
}

/// Extract inline `<img>`/`<audio>` references from free-form text.
///
/// Returns the structured prompt and whether any media was found. When
/// the flag is false the template equals the input and the caller
/// should use the plain-text path.
pub fn extract(raw: &str) -> (MultimodalPrompt, bool) {
    let mut images = HashMap::new();
    let mut audios = HashMap::new();
    let mut image_count = 0usize;
    let mut audio_count = 0usize;

    let template = extract_regions(raw, RULES, |kind, inner| {
        let index = match kind {
            MediaKind::Image => {
                let i = image_count;
                image_count += 1;
                i
            }
            MediaKind::Audio => {
                let i = audio_count;
                audio_count += 1;
                i
            }
        };
        let placeholder = format!("{}_{}", kind.placeholder_prefix(), index);
        match kind {
            MediaKind::Image => {
                images.insert(
                    placeholder.clone(),
                    ImagePart {
                        source: PathBuf::from(inner),
                        width: DEFAULT_IMAGE_EDGE,
                        height: DEFAULT_IMAGE_EDGE,
                    },
                );
            }
            MediaKind::Audio => {
                audios.insert(
                    placeholder.clone(),
                    AudioPart {
                        file_path: PathBuf::from(inner),
                    },
                );
            }
        }
        placeholder
    });

    let prompt = MultimodalPrompt {
        template,
        images,
        audios,
    };
    let has_multimodal = prompt.is_multimodal();

    if has_multimodal {
        tracing::debug!(
            images = prompt.images.len(),
            audios = prompt.audios.len(),
            "extracted multimodal references"
        );
    }

    (prompt, has_multimodal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passthrough() {
        let (prompt, multimodal) = extract("hello there");
        assert!(!multimodal);
        assert_eq!(prompt.template, "hello there");
        assert!(prompt.images.is_empty());
        assert!(prompt.audios.is_empty());
    }

    #[test]
    fn test_single_image() {
        let (prompt, multimodal) = extract("<img>/tmp/cat.jpg</img>what is this?");
        assert!(multimodal);
        assert_eq!(prompt.template, "image_0what is this?");
        assert_eq!(prompt.images.len(), 1);
        let part = &prompt.images["image_0"];
        assert_eq!(part.source, PathBuf::from("/tmp/cat.jpg"));
        assert_eq!(part.width, DEFAULT_IMAGE_EDGE);
    }

    #[test]
    fn test_image_and_audio_interleaved() {
        let (prompt, multimodal) =
            extract("<img>/a.png</img>listen<audio>/b.wav</audio>and<img>/c.png</img>");
        assert!(multimodal);
        assert_eq!(prompt.template, "image_0listenaudio_0andimage_1");
        assert_eq!(prompt.images.len(), 2);
        assert_eq!(prompt.audios.len(), 1);
        assert_eq!(prompt.images["image_1"].source, PathBuf::from("/c.png"));
        assert_eq!(prompt.audios["audio_0"].file_path, PathBuf::from("/b.wav"));
    }

    #[test]
    fn test_placeholders_unique_and_ordered() {
        let (prompt, _) = extract("<img>a</img><img>b</img><img>c</img>");
        assert_eq!(prompt.template, "image_0image_1image_2");
        assert_eq!(prompt.images["image_0"].source, PathBuf::from("a"));
        assert_eq!(prompt.images["image_1"].source, PathBuf::from("b"));
        assert_eq!(prompt.images["image_2"].source, PathBuf::from("c"));
    }

    #[test]
    fn test_round_trip_inner_text() {
        let raw = "look at <img>/pics/dog.jpg</img> and hear <audio>/rec/bark.wav</audio> now";
        let (prompt, _) = extract(raw);

        // Substituting each placeholder with its source must restore the
        // inner text (tag boundaries are allowed to differ).
        let mut rebuilt = prompt.template.clone();
        for (name, part) in &prompt.images {
            rebuilt = rebuilt.replace(name, &part.source.to_string_lossy());
        }
        for (name, part) in &prompt.audios {
            rebuilt = rebuilt.replace(name, &part.file_path.to_string_lossy());
        }
        assert_eq!(rebuilt, "look at /pics/dog.jpg and hear /rec/bark.wav now");
    }

    #[test]
    fn test_unmatched_open_tag_ignored() {
        let raw = "this <img>/tmp/x.png has no close tag";
        let (prompt, multimodal) = extract(raw);
        assert!(!multimodal);
        assert_eq!(prompt.template, raw);
    }

    #[test]
    fn test_unmatched_open_does_not_hide_later_regions() {
        let (prompt, multimodal) = extract("<img>oops<audio>/a.wav</audio>");
        assert!(multimodal);
        assert_eq!(prompt.template, "<img>oopsaudio_0");
        assert!(prompt.images.is_empty());
        assert_eq!(prompt.audios.len(), 1);
    }

    #[test]
    fn test_empty_input() {
        let (prompt, multimodal) = extract("");
        assert!(!multimodal);
        assert_eq!(prompt.template, "");
    }

    #[test]
    fn test_empty_inner_text_still_matches() {
        let (prompt, multimodal) = extract("<audio></audio>");
        assert!(multimodal);
        assert_eq!(prompt.template, "audio_0");
        assert_eq!(prompt.audios["audio_0"].file_path, PathBuf::from(""));
    }
}
