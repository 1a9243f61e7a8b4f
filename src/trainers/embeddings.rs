//! Token embedding constraints
//! The inserted concept tokens are the only rows allowed to train; every
//! other row is restored bit-identical from a frozen snapshot after each
//! optimizer step, and the trained rows are pulled back toward the
//! pretrained embedding norm statistics.

use anyhow::{bail, Result};
use candle_core::{Tensor, Var};
use log::debug;

/// One text encoder's embedding matrix plus its constraint bookkeeping.
pub struct EncoderEmbeddings {
    embeddings: Var,
    inserted_rows: Vec<usize>,
    snapshot: Tensor,
    target_std: f64,
}

impl EncoderEmbeddings {
    /// `inserted_rows` must be sorted and in-range; they stay trainable,
    /// everything else is frozen via the snapshot taken here.
    pub fn new(embeddings: Var, mut inserted_rows: Vec<usize>) -> Result<Self> {
        inserted_rows.sort_unstable();
        inserted_rows.dedup();
        let snapshot = embeddings.as_tensor().copy()?;
        let vocab_size = snapshot.dims()[0];
        if let Some(&last) = inserted_rows.last() {
            if last >= vocab_size {
                bail!("inserted token row {} out of range (vocab size {})", last, vocab_size);
            }
        }

        // Mean std of the pretrained rows, fixed at init. The inserted rows
        // are excluded so their (random) init does not skew the target.
        let all_stds = row_stds(&snapshot)?.to_vec1::<f32>()?;
        let mut sum = 0f64;
        let mut n = 0usize;
        for (row, &std) in all_stds.iter().enumerate() {
            if !inserted_rows.contains(&row) {
                sum += std as f64;
                n += 1;
            }
        }
        if n == 0 {
            bail!("embedding matrix has no frozen rows to derive a target std from");
        }

        Ok(Self {
            embeddings,
            inserted_rows,
            snapshot,
            target_std: sum / n as f64,
        })
    }

    pub fn var(&self) -> &Var {
        &self.embeddings
    }

    pub fn target_std(&self) -> f64 {
        self.target_std
    }

    /// The inserted rows as a detached `[n_tokens, dim]` view.
    pub fn trainable_rows(&self) -> Result<Tensor> {
        let indices = Tensor::from_vec(
            self.inserted_rows.iter().map(|&i| i as i64).collect::<Vec<_>>(),
            self.inserted_rows.len(),
            self.embeddings.device(),
        )?;
        Ok(self.embeddings.as_tensor().index_select(&indices, 0)?.detach())
    }

    /// Std of each inserted row.
    pub fn token_stds(&self) -> Result<Vec<f32>> {
        Ok(row_stds(&self.trainable_rows()?)?.to_vec1()?)
    }

    fn retract(&self) -> Result<()> {
        let trained = self.trainable_rows()?;
        let restored = overwrite_rows(&self.snapshot, &trained, &self.inserted_rows)?;
        self.embeddings.set(&restored)?;
        Ok(())
    }

    fn fix_std(&self, off_ratio_power: f64) -> Result<()> {
        let rows = self.trainable_rows()?;
        let stds = row_stds(&rows)?;
        let target = Tensor::full(
            self.target_std as f32,
            stds.dims(),
            stds.device(),
        )?;
        let factors = (target / stds)?.powf(off_ratio_power)?;
        let scaled = rows.broadcast_mul(&factors.unsqueeze(1)?)?;
        let updated = overwrite_rows(self.embeddings.as_tensor(), &scaled, &self.inserted_rows)?;
        self.embeddings.set(&updated)?;
        Ok(())
    }
}

/// Constraints over up to two encoders. `None` slots are skipped.
pub struct TokenEmbeddingsHandler {
    encoders: Vec<Option<EncoderEmbeddings>>,
}

impl TokenEmbeddingsHandler {
    pub fn new(encoders: Vec<Option<EncoderEmbeddings>>) -> Self {
        Self { encoders }
    }

    pub fn encoders(&self) -> &[Option<EncoderEmbeddings>] {
        &self.encoders
    }

    /// Full embedding matrices, for the textual-inversion parameter group.
    /// Gradients only reach the inserted rows; the retraction below undoes
    /// whatever the optimizer (weight decay included) did to the rest.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.encoders
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .map(|e| (format!("text_encoder_{}.token_embeddings", i), e.embeddings.clone()))
            })
            .collect()
    }

    /// Restore every frozen row bit-identical from the snapshot.
    pub fn retract(&self, print_diagnostics: bool) -> Result<()> {
        for slot in self.encoders.iter().flatten() {
            slot.retract()?;
            if print_diagnostics {
                debug!(
                    "token stds after retract: {:?} (target {:.5})",
                    slot.token_stds()?,
                    slot.target_std
                );
            }
        }
        Ok(())
    }

    /// Rescale each trained row by `(target_std / row_std) ^ off_ratio_power`,
    /// a soft pull toward the pretrained embedding statistics.
    pub fn fix_embedding_std(&self, off_ratio_power: f64) -> Result<()> {
        if off_ratio_power == 0.0 {
            return Ok(());
        }
        for slot in self.encoders.iter().flatten() {
            slot.fix_std(off_ratio_power)?;
        }
        Ok(())
    }

    /// Detached per-encoder views of the trained rows, `None` where the
    /// encoder slot is absent.
    pub fn get_trainable_embeddings(&self) -> Result<Vec<Option<Tensor>>> {
        self.encoders
            .iter()
            .map(|slot| slot.as_ref().map(|e| e.trainable_rows()).transpose())
            .collect()
    }
}

/// Population std of each row of a `[rows, dim]` matrix.
fn row_stds(matrix: &Tensor) -> Result<Tensor> {
    let mean = matrix.mean_keepdim(1)?;
    let centered = matrix.broadcast_sub(&mean)?;
    Ok(centered.sqr()?.mean(1)?.sqrt()?)
}

/// Copy of `base` with `replacement` rows written at the sorted `indices`.
fn overwrite_rows(base: &Tensor, replacement: &Tensor, indices: &[usize]) -> Result<Tensor> {
    let total_rows = base.dims()[0];
    let mut parts = Vec::new();
    let mut cursor = 0usize;
    for (i, &row) in indices.iter().enumerate() {
        if row > cursor {
            parts.push(base.narrow(0, cursor, row - cursor)?);
        }
        parts.push(replacement.narrow(0, i, 1)?.to_dtype(base.dtype())?);
        cursor = row + 1;
    }
    if cursor < total_rows {
        parts.push(base.narrow(0, cursor, total_rows - cursor)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}
