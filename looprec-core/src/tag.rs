//! Metadata tagging for finished segments.
//!
//! Runs off the real-time path: callers tag a segment after it closes (and
//! after the gain pass, which rewrites the file and would drop a tag
//! written earlier).

use std::path::Path;

use lofty::{Accessor, TagExt, TaggedFileExt};
use tracing::debug;

use crate::error::{RecorderError, Result};

/// Tag values to attach to a segment file. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
}

impl TrackTags {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.artist.is_none() && self.album.is_none()
    }
}

/// Write `tags` into the file's primary tag, creating one when the file
/// has none (fresh WAV segments carry no tag chunk).
///
/// # Errors
/// `RecorderError::Tag` when the container cannot be probed or the tag
/// cannot be saved; the audio data is never touched.
pub fn tag(path: &Path, tags: &TrackTags) -> Result<()> {
    if tags.is_empty() {
        return Ok(());
    }

    let mut tagged_file =
        lofty::read_from_path(path).map_err(|e| RecorderError::Tag(e.to_string()))?;

    let tag_type = tagged_file.primary_tag_type();
    let tag = match tagged_file.tag_mut(tag_type) {
        Some(t) => t,
        None => {
            tagged_file.insert_tag(lofty::Tag::new(tag_type));
            tagged_file
                .tag_mut(tag_type)
                .ok_or_else(|| RecorderError::Tag("failed to attach a new tag".into()))?
        }
    };

    if let Some(title) = &tags.title {
        tag.set_title(title.clone());
    }
    if let Some(artist) = &tags.artist {
        tag.set_artist(artist.clone());
    }
    if let Some(album) = &tags.album {
        tag.set_album(album.clone());
    }

    tag.save_to_path(path)
        .map_err(|e| RecorderError::Tag(e.to_string()))?;

    debug!(path = %path.display(), "tags written");
    Ok(())
}
