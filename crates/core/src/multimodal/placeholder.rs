//! Image placeholder location and expansion.
//!
//! A tokenized prompt carries one placeholder id per image. Before the
//! prefill pass every placeholder is expanded into a block of `slot_count`
//! sentinel ids, one per fused visual token, so that the assembler can later
//! overwrite exactly those rows of the lexical embeddings.
//!
//! ```text
//! [bos, T_img, describe]  --(N = 4)-->  [bos, S, S, S, S, describe]
//!                                              ^ block { start: 1, len: 4 }
//! ```

use std::ops::Range;

use super::error::{FusionError, Result};

/// Default image placeholder id (`-200` reinterpreted as u32).
pub const DEFAULT_IMAGE_TOKEN_ID: u32 = u32::MAX - 199;
/// Sentinel id marking expanded image slots (`-201` reinterpreted as u32).
pub const DEFAULT_SENTINEL_TOKEN_ID: u32 = u32::MAX - 200;
/// Slots per image for the single-frame 12x30 selector grid plus class token.
pub const DEFAULT_SLOT_COUNT: usize = 361;

/// Configuration of the placeholder expander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderConfig {
    /// Token id marking where an image belongs in the prompt.
    pub image_token_id: u32,
    /// Token id written into every expanded image slot.
    pub sentinel_id: u32,
    /// Number of slots each image expands to.
    pub slot_count: usize,
    /// Keep the placeholder token and insert the slots after it instead of
    /// replacing it.
    pub keep_placeholder: bool,
    /// Id substituted for sentinels before the lexical embedding lookup.
    pub pad_token_id: u32,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            image_token_id: DEFAULT_IMAGE_TOKEN_ID,
            sentinel_id: DEFAULT_SENTINEL_TOKEN_ID,
            slot_count: DEFAULT_SLOT_COUNT,
            keep_placeholder: false,
            pad_token_id: 0,
        }
    }
}

impl PlaceholderConfig {
    /// Check the reserved ids against each other and, when known, the vocabulary.
    pub fn validate(&self, vocab_size: Option<usize>) -> Result<()> {
        if self.slot_count == 0 {
            return Err(FusionError::InvalidConfig(
                "slot_count must be positive".to_string(),
            ));
        }
        if self.image_token_id == self.sentinel_id {
            return Err(FusionError::InvalidConfig(format!(
                "image token id and expansion sentinel id are both {}",
                self.sentinel_id
            )));
        }
        if let Some(vocab) = vocab_size {
            for (name, id) in [
                ("image token id", self.image_token_id),
                ("expansion sentinel id", self.sentinel_id),
            ] {
                if (id as usize) < vocab {
                    return Err(FusionError::InvalidConfig(format!(
                        "{name} {id} collides with the vocabulary (size {vocab})"
                    )));
                }
            }
            if self.pad_token_id as usize >= vocab {
                return Err(FusionError::InvalidConfig(format!(
                    "pad token id {} is outside the vocabulary (size {vocab})",
                    self.pad_token_id
                )));
            }
        }
        Ok(())
    }
}

/// One located placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderSite {
    /// Index of the placeholder in the unexpanded sequence.
    pub position: usize,
    /// Ordinal of the image this placeholder stands for.
    pub image_index: usize,
}

/// Span of expanded image slots inside an expanded token sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSlotBlock {
    pub start: usize,
    pub len: usize,
}

impl ImageSlotBlock {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Result of placeholder expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedPrompt {
    pub token_ids: Vec<u32>,
    /// One block per image, in placeholder order.
    pub blocks: Vec<ImageSlotBlock>,
}

impl ExpandedPrompt {
    /// A prompt without images.
    pub fn text_only(token_ids: Vec<u32>) -> Self {
        Self {
            token_ids,
            blocks: Vec::new(),
        }
    }

    pub fn num_image_slots(&self) -> usize {
        self.blocks.iter().map(|b| b.len).sum()
    }

    pub fn count_sentinels(&self, sentinel_id: u32) -> usize {
        count_sentinels(&self.token_ids, sentinel_id)
    }

    /// Token ids safe for the lexical embedding table: sentinels become `pad_token_id`.
    pub fn lexical_ids(&self, sentinel_id: u32, pad_token_id: u32) -> Vec<u32> {
        self.token_ids
            .iter()
            .map(|&id| if id == sentinel_id { pad_token_id } else { id })
            .collect()
    }

    /// Lexical ids under `cfg`; kept placeholders are padded as well.
    pub fn lexical_ids_for(&self, cfg: &PlaceholderConfig) -> Vec<u32> {
        self.token_ids
            .iter()
            .map(|&id| {
                if id == cfg.sentinel_id || id == cfg.image_token_id {
                    cfg.pad_token_id
                } else {
                    id
                }
            })
            .collect()
    }
}

pub fn count_sentinels(token_ids: &[u32], sentinel_id: u32) -> usize {
    token_ids.iter().filter(|&&id| id == sentinel_id).count()
}

/// Positions of `image_token_id` in `token_ids`, ascending.
pub fn find_placeholder_positions(token_ids: &[u32], image_token_id: u32) -> Vec<usize> {
    token_ids
        .iter()
        .enumerate()
        .filter_map(|(i, &id)| (id == image_token_id).then_some(i))
        .collect()
}

/// Locate the placeholders for `num_images` images.
///
/// Exactly one placeholder per image is required.
pub fn locate_placeholders(
    token_ids: &[u32],
    image_token_id: u32,
    num_images: usize,
) -> Result<Vec<PlaceholderSite>> {
    let positions = find_placeholder_positions(token_ids, image_token_id);
    if positions.len() != num_images {
        return Err(FusionError::MalformedPlaceholders(format!(
            "found {} placeholders but {} images",
            positions.len(),
            num_images
        )));
    }
    Ok(positions
        .into_iter()
        .enumerate()
        .map(|(image_index, position)| PlaceholderSite {
            position,
            image_index,
        })
        .collect())
}

/// Expand every placeholder site into `cfg.slot_count` sentinel ids.
///
/// Single left-to-right pass; text runs between placeholders are copied
/// unchanged. Sites must be strictly increasing and inside the sequence.
pub fn expand_placeholders(
    token_ids: &[u32],
    sites: &[PlaceholderSite],
    cfg: &PlaceholderConfig,
) -> Result<ExpandedPrompt> {
    if sites.is_empty() {
        return Ok(ExpandedPrompt::text_only(token_ids.to_vec()));
    }

    let per_site = if cfg.keep_placeholder {
        cfg.slot_count
    } else {
        cfg.slot_count.saturating_sub(1)
    };
    let mut expanded = Vec::with_capacity(token_ids.len() + sites.len() * per_site);
    let mut blocks = Vec::with_capacity(sites.len());
    let mut cursor = 0usize;

    for (i, site) in sites.iter().enumerate() {
        if site.position >= token_ids.len() {
            return Err(FusionError::MalformedPlaceholders(format!(
                "placeholder {} at position {} is outside a sequence of length {}",
                i,
                site.position,
                token_ids.len()
            )));
        }
        if i > 0 && site.position <= sites[i - 1].position {
            return Err(FusionError::MalformedPlaceholders(format!(
                "placeholder positions not strictly increasing: {} after {}",
                site.position,
                sites[i - 1].position
            )));
        }

        let copy_end = if cfg.keep_placeholder {
            site.position + 1
        } else {
            site.position
        };
        expanded.extend_from_slice(&token_ids[cursor..copy_end]);
        blocks.push(ImageSlotBlock {
            start: expanded.len(),
            len: cfg.slot_count,
        });
        expanded.resize(expanded.len() + cfg.slot_count, cfg.sentinel_id);
        cursor = site.position + 1;
    }
    expanded.extend_from_slice(&token_ids[cursor..]);

    Ok(ExpandedPrompt {
        token_ids: expanded,
        blocks,
    })
}

/// Join prompt chunks tokenized separately around each image marker.
///
/// One `image_token_id` is placed between consecutive chunks. When the first
/// chunk starts with `bos_token_id` the BOS is emitted once at the front and
/// stripped from the start of every chunk.
pub fn insert_image_tokens(
    chunks: &[Vec<u32>],
    image_token_id: u32,
    bos_token_id: Option<u32>,
) -> Vec<u32> {
    let has_bos = match (chunks.first().and_then(|c| c.first()), bos_token_id) {
        (Some(&first), Some(bos)) => first == bos,
        _ => false,
    };

    let mut ids = Vec::with_capacity(chunks.iter().map(Vec::len).sum::<usize>() + chunks.len());
    if has_bos {
        if let Some(bos) = bos_token_id {
            ids.push(bos);
        }
    }
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 {
            ids.push(image_token_id);
        }
        let body = if has_bos && chunk.first() == bos_token_id.as_ref() {
            &chunk[1..]
        } else {
            &chunk[..]
        };
        ids.extend_from_slice(body);
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMG: u32 = 900;
    const SENT: u32 = 901;

    fn cfg(slot_count: usize, keep_placeholder: bool) -> PlaceholderConfig {
        PlaceholderConfig {
            image_token_id: IMG,
            sentinel_id: SENT,
            slot_count,
            keep_placeholder,
            pad_token_id: 0,
        }
    }

    fn expand(tokens: &[u32], c: &PlaceholderConfig) -> ExpandedPrompt {
        let n = find_placeholder_positions(tokens, c.image_token_id).len();
        let sites = locate_placeholders(tokens, c.image_token_id, n).unwrap();
        expand_placeholders(tokens, &sites, c).unwrap()
    }

    #[test]
    fn test_find_placeholder_positions() {
        let tokens = vec![1, 2, IMG, 3, 4, IMG, 5];
        assert_eq!(find_placeholder_positions(&tokens, IMG), vec![2, 5]);
        assert!(find_placeholder_positions(&[1, 2, 3], IMG).is_empty());
    }

    #[test]
    fn test_describe_prompt_expansion() {
        let describe = 42;
        let out = expand(&[IMG, describe], &cfg(4, false));
        assert_eq!(out.token_ids, vec![SENT, SENT, SENT, SENT, describe]);
        assert_eq!(out.blocks, vec![ImageSlotBlock { start: 0, len: 4 }]);
    }

    #[test]
    fn test_consume_mode_length() {
        let tokens = vec![1, IMG, 2, 3, IMG, IMG, 4];
        let out = expand(&tokens, &cfg(5, false));
        assert_eq!(out.token_ids.len(), tokens.len() + 3 * (5 - 1));
        assert_eq!(out.blocks.len(), 3);
        assert!(!out.token_ids.contains(&IMG));
    }

    #[test]
    fn test_keep_mode_length_and_placement() {
        let tokens = vec![1, IMG, 2];
        let out = expand(&tokens, &cfg(3, true));
        assert_eq!(out.token_ids, vec![1, IMG, SENT, SENT, SENT, 2]);
        assert_eq!(out.token_ids.len(), tokens.len() + 3);
        assert_eq!(out.blocks, vec![ImageSlotBlock { start: 2, len: 3 }]);
    }

    #[test]
    fn test_blocks_ordered_and_disjoint() {
        let tokens = vec![IMG, 7, 8, IMG, IMG, 9];
        let out = expand(&tokens, &cfg(6, false));
        for pair in out.blocks.windows(2) {
            assert!(pair[0].end() <= pair[1].start);
        }
        assert_eq!(out.blocks[0].start, 0);
        assert_eq!(out.blocks[1].start, 6 + 2);
        assert_eq!(out.blocks[2].start, 6 + 2 + 6);
        let text_len = out.token_ids.len() - out.num_image_slots();
        assert_eq!(text_len, 3);
    }

    #[test]
    fn test_sentinels_fill_each_block() {
        let tokens = vec![5, IMG, 6, IMG];
        for keep in [false, true] {
            let out = expand(&tokens, &cfg(7, keep));
            for block in &out.blocks {
                let n = count_sentinels(&out.token_ids[block.range()], SENT);
                assert_eq!(n, block.len);
            }
            assert_eq!(out.count_sentinels(SENT), out.num_image_slots());
        }
    }

    #[test]
    fn test_zero_placeholders_passthrough() {
        let tokens = vec![1, 2, 3];
        let out = expand_placeholders(&tokens, &[], &cfg(4, false)).unwrap();
        assert_eq!(out.token_ids, tokens);
        assert!(out.blocks.is_empty());
    }

    #[test]
    fn test_non_increasing_sites_rejected() {
        let tokens = vec![IMG, 1, IMG];
        let sites = [
            PlaceholderSite {
                position: 2,
                image_index: 0,
            },
            PlaceholderSite {
                position: 0,
                image_index: 1,
            },
        ];
        let err = expand_placeholders(&tokens, &sites, &cfg(2, false)).unwrap_err();
        assert!(matches!(err, FusionError::MalformedPlaceholders(_)));

        let dup = [sites[0], sites[0]];
        let err = expand_placeholders(&tokens, &dup, &cfg(2, false)).unwrap_err();
        assert!(matches!(err, FusionError::MalformedPlaceholders(_)));
    }

    #[test]
    fn test_out_of_range_site_rejected() {
        let sites = [PlaceholderSite {
            position: 3,
            image_index: 0,
        }];
        let err = expand_placeholders(&[1, 2, 3], &sites, &cfg(2, false)).unwrap_err();
        assert!(matches!(err, FusionError::MalformedPlaceholders(_)));
    }

    #[test]
    fn test_missing_placeholder_with_images() {
        let err = locate_placeholders(&[1, 2, 3], IMG, 1).unwrap_err();
        assert!(matches!(err, FusionError::MalformedPlaceholders(_)));

        let err = locate_placeholders(&[IMG, IMG], IMG, 1).unwrap_err();
        assert!(matches!(err, FusionError::MalformedPlaceholders(_)));
    }

    #[test]
    fn test_lexical_ids_mask_sentinels() {
        let out = expand(&[3, IMG, 4], &cfg(2, false));
        assert_eq!(out.lexical_ids(SENT, 0), vec![3, 0, 0, 4]);
    }

    #[test]
    fn test_lexical_ids_for_pads_kept_placeholder() {
        let keep = PlaceholderConfig {
            pad_token_id: 7,
            ..cfg(2, true)
        };
        let out = expand(&[3, IMG, 4], &keep);
        assert_eq!(out.token_ids, vec![3, IMG, SENT, SENT, 4]);
        assert_eq!(out.lexical_ids_for(&keep), vec![3, 7, 7, 7, 4]);
    }

    #[test]
    fn test_insert_image_tokens_with_bos() {
        let chunks = vec![vec![1, 10, 11], vec![1, 12], vec![1, 13, 14]];
        let ids = insert_image_tokens(&chunks, IMG, Some(1));
        assert_eq!(ids, vec![1, 10, 11, IMG, 12, IMG, 13, 14]);
    }

    #[test]
    fn test_insert_image_tokens_without_bos() {
        let chunks = vec![vec![], vec![20, 21]];
        let ids = insert_image_tokens(&chunks, IMG, Some(1));
        assert_eq!(ids, vec![IMG, 20, 21]);
    }

    #[test]
    fn test_config_validation() {
        assert!(PlaceholderConfig::default().validate(Some(152_064)).is_ok());

        let clash = PlaceholderConfig {
            sentinel_id: IMG,
            ..cfg(4, false)
        };
        assert!(matches!(
            clash.validate(None),
            Err(FusionError::InvalidConfig(_))
        ));

        let in_vocab = cfg(4, false);
        assert!(matches!(
            in_vocab.validate(Some(1000)),
            Err(FusionError::InvalidConfig(_))
        ));
        assert!(in_vocab.validate(Some(900)).is_ok());
    }
}
