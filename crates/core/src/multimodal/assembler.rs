//! Batched embedding assembly.
//!
//! Splices projected image features into the lexical embeddings of expanded
//! prompts. The whole batch is validated before any tensor is built, so a
//! single inconsistent request fails the batch without partial output.

use candle_core::Tensor;
use tracing::warn;

use super::error::{FusionError, Result};
use super::placeholder::ImageSlotBlock;

/// One expanded request ready for splicing.
#[derive(Debug, Clone, Copy)]
pub struct SpliceRequest<'a> {
    /// Expanded token ids; image slots hold the sentinel id.
    pub token_ids: &'a [u32],
    /// Lexical embeddings `[token_ids.len(), hidden]`; rows at image slots are ignored.
    pub lexical: &'a Tensor,
    pub blocks: &'a [ImageSlotBlock],
    /// Projected image features, one `[block.len, hidden]` tensor per block.
    pub features: &'a [Tensor],
}

/// Concatenate the spliced embeddings of every request, in batch order.
///
/// Returns `[sum(token_ids.len()), hidden]`.
pub fn assemble_batch(requests: &[SpliceRequest<'_>], sentinel_id: u32) -> Result<Tensor> {
    if requests.is_empty() {
        return Err(FusionError::EmptyBatch);
    }

    let mut hidden: Option<usize> = None;
    let mut ordered = Vec::with_capacity(requests.len());
    for (idx, req) in requests.iter().enumerate() {
        ordered.push(validate_request(idx, req, sentinel_id, &mut hidden)?);
    }

    let mut rows = Vec::with_capacity(requests.len());
    for (req, order) in requests.iter().zip(&ordered) {
        if let Some(spliced) = splice_request(req, order)? {
            rows.push(spliced);
        }
    }
    if rows.is_empty() {
        // every request was empty
        let lexical = requests[0].lexical;
        return Ok(lexical.narrow(0, 0, 0)?);
    }
    Ok(Tensor::cat(&rows, 0)?)
}

fn mismatch(request: usize, expected: usize, found: usize, what: &str) -> FusionError {
    warn!(request, expected, found, what, "Image feature mismatch, failing batch");
    FusionError::FeatureCountMismatch {
        request,
        expected,
        found,
    }
}

/// Check one request; returns its block indices sorted by start.
fn validate_request(
    idx: usize,
    req: &SpliceRequest<'_>,
    sentinel_id: u32,
    hidden: &mut Option<usize>,
) -> Result<Vec<usize>> {
    let len = req.token_ids.len();
    let (rows, width) = req.lexical.dims2()?;
    if rows != len {
        return Err(mismatch(idx, len, rows, "lexical rows"));
    }
    match *hidden {
        Some(h) if h != width => {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "request {idx} has hidden width {width}, batch uses {h}"
            )))
        }
        Some(_) => {}
        None => *hidden = Some(width),
    }

    if req.features.len() != req.blocks.len() {
        return Err(mismatch(
            idx,
            req.blocks.len(),
            req.features.len(),
            "feature blocks",
        ));
    }

    let mut order: Vec<usize> = (0..req.blocks.len()).collect();
    order.sort_by_key(|&i| req.blocks[i].start);

    let mut cursor = 0;
    let mut slots = 0;
    for &i in &order {
        let block = req.blocks[i];
        if block.start < cursor {
            return Err(mismatch(idx, cursor, block.start, "overlapping block start"));
        }
        let end = match block.start.checked_add(block.len) {
            Some(end) if end <= len => end,
            Some(end) => return Err(mismatch(idx, len, end, "block end")),
            None => return Err(mismatch(idx, len, usize::MAX, "block end")),
        };

        let (feat_rows, feat_width) = req.features[i].dims2()?;
        if feat_rows != block.len {
            return Err(mismatch(idx, block.len, feat_rows, "feature rows"));
        }
        if feat_width != width {
            return Err(FusionError::IncompatibleFeatureShape(format!(
                "request {idx} image {i} has width {feat_width}, expected {width}"
            )));
        }

        let in_span = req.token_ids[block.start..end]
            .iter()
            .filter(|&&t| t == sentinel_id)
            .count();
        if in_span != block.len {
            return Err(mismatch(idx, block.len, in_span, "sentinels in block"));
        }

        cursor = end;
        slots += block.len;
    }

    let sentinels = req.token_ids.iter().filter(|&&t| t == sentinel_id).count();
    if sentinels != slots {
        return Err(mismatch(idx, slots, sentinels, "sentinels in request"));
    }
    Ok(order)
}

fn splice_request(req: &SpliceRequest<'_>, order: &[usize]) -> Result<Option<Tensor>> {
    let dtype = req.lexical.dtype();
    let mut segments = Vec::with_capacity(2 * order.len() + 1);
    let mut cursor = 0;
    for &i in order {
        let block = req.blocks[i];
        if block.start > cursor {
            segments.push(req.lexical.narrow(0, cursor, block.start - cursor)?);
        }
        if block.len > 0 {
            segments.push(req.features[i].to_dtype(dtype)?);
        }
        cursor = block.end();
    }
    let len = req.token_ids.len();
    if len > cursor {
        segments.push(req.lexical.narrow(0, cursor, len - cursor)?);
    }
    if segments.is_empty() {
        return Ok(None);
    }
    Ok(Some(Tensor::cat(&segments, 0)?))
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    const S: u32 = 9_999;

    /// Row `i` is filled with `i`.
    fn lexical(len: usize, hidden: usize) -> Tensor {
        let data: Vec<f32> = (0..len)
            .flat_map(|i| std::iter::repeat(i as f32).take(hidden))
            .collect();
        Tensor::from_vec(data, (len, hidden), &Device::Cpu).unwrap()
    }

    fn features(rows: usize, hidden: usize, value: f32) -> Tensor {
        Tensor::full(value, (rows, hidden), &Device::Cpu).unwrap()
    }

    fn first_column(x: &Tensor) -> Vec<f32> {
        x.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap()
    }

    fn tokens_with_span(len: usize, start: usize, span: usize) -> Vec<u32> {
        (0..len)
            .map(|i| {
                if (start..start + span).contains(&i) {
                    S
                } else {
                    i as u32
                }
            })
            .collect()
    }

    #[test]
    fn test_single_block_splice() {
        let ids = tokens_with_span(20, 10, 5);
        let lex = lexical(20, 4);
        let blocks = [ImageSlotBlock { start: 10, len: 5 }];
        let feats = [features(5, 4, -1.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &blocks,
            features: &feats,
        };

        let out = assemble_batch(&[req], S).unwrap();
        assert_eq!(out.dims(), &[20, 4]);
        let col = first_column(&out);
        for (i, v) in col.iter().enumerate() {
            if (10..15).contains(&i) {
                assert_eq!(*v, -1.0);
            } else {
                assert_eq!(*v, i as f32);
            }
        }
    }

    #[test]
    fn test_feature_count_mismatch_fails_batch() {
        let ids = tokens_with_span(20, 10, 3);
        let lex = lexical(20, 4);
        let blocks = [ImageSlotBlock { start: 10, len: 5 }];
        let feats = [features(5, 4, -1.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &blocks,
            features: &feats,
        };

        let err = assemble_batch(&[req], S).unwrap_err();
        assert!(matches!(
            err,
            FusionError::FeatureCountMismatch {
                request: 0,
                expected: 5,
                found: 3
            }
        ));
    }

    #[test]
    fn test_batch_concatenates_in_order() {
        let ids_a = tokens_with_span(6, 1, 2);
        let lex_a = lexical(6, 2);
        let blocks_a = [ImageSlotBlock { start: 1, len: 2 }];
        let feats_a = [features(2, 2, -1.0)];

        let ids_b: Vec<u32> = vec![7, 8, 9];
        let lex_b = (lexical(3, 2) + 100.0).unwrap();

        let out = assemble_batch(
            &[
                SpliceRequest {
                    token_ids: &ids_a,
                    lexical: &lex_a,
                    blocks: &blocks_a,
                    features: &feats_a,
                },
                SpliceRequest {
                    token_ids: &ids_b,
                    lexical: &lex_b,
                    blocks: &[],
                    features: &[],
                },
            ],
            S,
        )
        .unwrap();

        assert_eq!(
            first_column(&out),
            vec![0.0, -1.0, -1.0, 3.0, 4.0, 5.0, 100.0, 101.0, 102.0]
        );
    }

    #[test]
    fn test_unsorted_blocks_keep_their_features() {
        let mut ids = tokens_with_span(8, 1, 2);
        ids[5] = S;
        ids[6] = S;
        let lex = lexical(8, 1);
        let blocks = [
            ImageSlotBlock { start: 5, len: 2 },
            ImageSlotBlock { start: 1, len: 2 },
        ];
        let feats = [features(2, 1, -2.0), features(2, 1, -1.0)];
        let out = assemble_batch(
            &[SpliceRequest {
                token_ids: &ids,
                lexical: &lex,
                blocks: &blocks,
                features: &feats,
            }],
            S,
        )
        .unwrap();
        assert_eq!(
            first_column(&out),
            vec![0.0, -1.0, -1.0, 3.0, 4.0, -2.0, -2.0, 7.0]
        );
    }

    #[test]
    fn test_later_request_failure_produces_no_output() {
        let ids = tokens_with_span(4, 0, 2);
        let lex = lexical(4, 2);
        let blocks = [ImageSlotBlock { start: 0, len: 2 }];
        let good = [features(2, 2, 0.0)];
        let bad = [features(1, 2, 0.0)];
        let err = assemble_batch(
            &[
                SpliceRequest {
                    token_ids: &ids,
                    lexical: &lex,
                    blocks: &blocks,
                    features: &good,
                },
                SpliceRequest {
                    token_ids: &ids,
                    lexical: &lex,
                    blocks: &blocks,
                    features: &bad,
                },
            ],
            S,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FusionError::FeatureCountMismatch { request: 1, .. }
        ));
    }

    #[test]
    fn test_rejects_overlap_range_and_width() {
        let ids = vec![S; 6];
        let lex = lexical(6, 2);

        let overlapping = [
            ImageSlotBlock { start: 0, len: 4 },
            ImageSlotBlock { start: 2, len: 2 },
        ];
        let feats = [features(4, 2, 0.0), features(2, 2, 0.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &overlapping,
            features: &feats,
        };
        assert!(matches!(
            assemble_batch(&[req], S),
            Err(FusionError::FeatureCountMismatch { .. })
        ));

        let out_of_range = [ImageSlotBlock { start: 4, len: 4 }];
        let feats = [features(4, 2, 0.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &out_of_range,
            features: &feats,
        };
        assert!(matches!(
            assemble_batch(&[req], S),
            Err(FusionError::FeatureCountMismatch { .. })
        ));

        let block = [ImageSlotBlock { start: 0, len: 6 }];
        let wide = [features(6, 3, 0.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &block,
            features: &wide,
        };
        assert!(matches!(
            assemble_batch(&[req], S),
            Err(FusionError::IncompatibleFeatureShape(_))
        ));
    }

    #[test]
    fn test_overflowing_block_end_is_a_mismatch() {
        let ids = tokens_with_span(4, 0, 2);
        let lex = lexical(4, 2);
        let blocks = [ImageSlotBlock {
            start: usize::MAX,
            len: 2,
        }];
        let feats = [features(2, 2, 0.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &blocks,
            features: &feats,
        };
        assert!(matches!(
            assemble_batch(&[req], S),
            Err(FusionError::FeatureCountMismatch {
                request: 0,
                expected: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_stray_sentinel_outside_blocks_rejected() {
        let mut ids = tokens_with_span(6, 0, 2);
        ids[5] = S;
        let lex = lexical(6, 2);
        let blocks = [ImageSlotBlock { start: 0, len: 2 }];
        let feats = [features(2, 2, 0.0)];
        let req = SpliceRequest {
            token_ids: &ids,
            lexical: &lex,
            blocks: &blocks,
            features: &feats,
        };
        assert!(matches!(
            assemble_batch(&[req], S),
            Err(FusionError::FeatureCountMismatch {
                expected: 2,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_batch() {
        assert!(matches!(assemble_batch(&[], S), Err(FusionError::EmptyBatch)));
    }

    #[test]
    fn test_feature_dtype_follows_lexical() {
        let ids = vec![S, 1];
        let lex = Tensor::zeros((2, 2), DType::F16, &Device::Cpu).unwrap();
        let blocks = [ImageSlotBlock { start: 0, len: 1 }];
        let feats = [features(1, 2, 1.0)];
        let out = assemble_batch(
            &[SpliceRequest {
                token_ids: &ids,
                lexical: &lex,
                blocks: &blocks,
                features: &feats,
            }],
            S,
        )
        .unwrap();
        assert_eq!(out.dtype(), DType::F16);
    }
}
