//! Reference SegNet stages.
//!
//! Encoder stages mix channels, rectify and max-pool 2x2, handing their pooling
//! indices to the mirrored decoder stage. Decoder stages max-unpool with those
//! indices and mix channels. Heavier convolutional blocks plug in through
//! [`StageTransform`].

use ndarray::{Array1, Array2, Array4, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use segmentation_core::{SegError, SegResult, StageName, Tensor4};

/// Position of the maximum inside each 2x2 pooling window (0..4, row-major).
#[derive(Debug, Clone)]
pub struct PoolIndices {
    pub argmax: Array4<u8>,
    /// Spatial size before pooling.
    pub unpool_rows: usize,
    pub unpool_cols: usize,
}

#[derive(Debug, Clone)]
pub struct StageOutput {
    pub activation: Tensor4,
    /// Set by encoder stages.
    pub pool: Option<PoolIndices>,
}

/// A named network stage with fixed channel dimensions.
pub trait StageTransform: Send + Sync {
    fn in_channels(&self) -> usize;

    fn out_channels(&self) -> usize;

    /// `pool` carries the mirrored encoder's indices when this is a decoder stage.
    fn forward(&self, input: &Tensor4, pool: Option<&PoolIndices>) -> SegResult<StageOutput>;

    /// Learnable tensors keyed by a local name.
    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)>;

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)>;
}

/// 1x1 channel mixing: `out[b, o] = sum_i weight[o, i] * in[b, i] + bias[o]`.
fn mix_channels(input: &Tensor4, weight: &Array2<f32>, bias: &Array1<f32>) -> SegResult<Tensor4> {
    let (batch, channels, rows, cols) = input.dim();
    if channels != weight.ncols() {
        return Err(SegError::ShapeMismatch {
            context: "channel mixing".to_string(),
            expected: vec![batch, weight.ncols(), rows, cols],
            actual: input.shape().to_vec(),
        });
    }

    let out_channels = weight.nrows();
    let mut output = Tensor4::zeros((batch, out_channels, rows, cols));
    let column_bias = bias.view().insert_axis(Axis(1));
    for (sample, mut target) in input.outer_iter().zip(output.outer_iter_mut()) {
        let flat = sample.to_shape((channels, rows * cols)).map_err(|e| SegError::ShapeMismatch {
            context: format!("channel mixing: {}", e),
            expected: vec![channels, rows * cols],
            actual: sample.shape().to_vec(),
        })?;
        let mut mixed = weight.dot(&flat);
        mixed += &column_bias;
        for (o, row) in mixed.outer_iter().enumerate() {
            for (dst, &v) in target.index_axis_mut(Axis(0), o).iter_mut().zip(row.iter()) {
                *dst = v;
            }
        }
    }
    Ok(output)
}

fn relu_inplace(t: &mut Tensor4) {
    t.mapv_inplace(|v| v.max(0.0));
}

fn max_pool2(input: &Tensor4) -> (Tensor4, PoolIndices) {
    let (batch, channels, rows, cols) = input.dim();
    let (pooled_rows, pooled_cols) = (rows / 2, cols / 2);
    let mut pooled = Tensor4::zeros((batch, channels, pooled_rows, pooled_cols));
    let mut argmax = Array4::<u8>::zeros((batch, channels, pooled_rows, pooled_cols));

    Zip::indexed(&mut pooled)
        .and(&mut argmax)
        .for_each(|(b, c, r, col), value, index| {
            let mut best = f32::NEG_INFINITY;
            let mut best_k = 0u8;
            for k in 0..4u8 {
                let v = input[[b, c, 2 * r + (k / 2) as usize, 2 * col + (k % 2) as usize]];
                if v > best {
                    best = v;
                    best_k = k;
                }
            }
            *value = best;
            *index = best_k;
        });

    (
        pooled,
        PoolIndices {
            argmax,
            unpool_rows: rows,
            unpool_cols: cols,
        },
    )
}

fn max_unpool2(input: &Tensor4, pool: &PoolIndices) -> SegResult<Tensor4> {
    if input.dim() != pool.argmax.dim() {
        return Err(SegError::ShapeMismatch {
            context: "max unpooling".to_string(),
            expected: pool.argmax.shape().to_vec(),
            actual: input.shape().to_vec(),
        });
    }
    let (batch, channels, _, _) = input.dim();
    let mut output = Tensor4::zeros((batch, channels, pool.unpool_rows, pool.unpool_cols));
    Zip::indexed(input)
        .and(&pool.argmax)
        .for_each(|(b, c, r, col), &v, &k| {
            output[[b, c, 2 * r + (k / 2) as usize, 2 * col + (k % 2) as usize]] = v;
        });
    Ok(output)
}

fn init_weight(out_channels: usize, in_channels: usize, rng: &mut StdRng) -> Array2<f32> {
    let bound = (6.0 / (in_channels + out_channels) as f32).sqrt();
    let uniform = Uniform::new_inclusive(-bound, bound);
    Array2::from_shape_simple_fn((out_channels, in_channels), || uniform.sample(rng))
}

/// Channel mixing + ReLU + 2x2 max-pool.
#[derive(Debug, Clone)]
pub struct EncoderStage {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl EncoderStage {
    pub fn new(in_channels: usize, out_channels: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: init_weight(out_channels, in_channels, rng),
            bias: Array1::zeros(out_channels),
        }
    }

    pub fn from_parameters(weight: Array2<f32>, bias: Array1<f32>) -> SegResult<Self> {
        if weight.nrows() != bias.len() {
            return Err(SegError::ShapeMismatch {
                context: "encoder bias".to_string(),
                expected: vec![weight.nrows()],
                actual: vec![bias.len()],
            });
        }
        Ok(Self { weight, bias })
    }
}

impl StageTransform for EncoderStage {
    fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, input: &Tensor4, _pool: Option<&PoolIndices>) -> SegResult<StageOutput> {
        let mut mixed = mix_channels(input, &self.weight, &self.bias)?;
        relu_inplace(&mut mixed);
        let (activation, pool) = max_pool2(&mixed);
        Ok(StageOutput {
            activation,
            pool: Some(pool),
        })
    }

    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("weight", self.weight.view().into_dyn()),
            ("bias", self.bias.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weight", self.weight.view_mut().into_dyn()),
            ("bias", self.bias.view_mut().into_dyn()),
        ]
    }
}

/// 2x2 max-unpool + channel mixing, rectified unless it emits the final logits.
#[derive(Debug, Clone)]
pub struct DecoderStage {
    weight: Array2<f32>,
    bias: Array1<f32>,
    rectify: bool,
}

impl DecoderStage {
    pub fn new(in_channels: usize, out_channels: usize, rectify: bool, rng: &mut StdRng) -> Self {
        Self {
            weight: init_weight(out_channels, in_channels, rng),
            bias: Array1::zeros(out_channels),
            rectify,
        }
    }
}

impl StageTransform for DecoderStage {
    fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    fn out_channels(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, input: &Tensor4, pool: Option<&PoolIndices>) -> SegResult<StageOutput> {
        let pool = pool.ok_or_else(|| SegError::ShapeMismatch {
            context: "decoder stage called without pooling indices".to_string(),
            expected: Vec::new(),
            actual: input.shape().to_vec(),
        })?;
        let unpooled = max_unpool2(input, pool)?;
        let mut activation = mix_channels(&unpooled, &self.weight, &self.bias)?;
        if self.rectify {
            relu_inplace(&mut activation);
        }
        Ok(StageOutput {
            activation,
            pool: None,
        })
    }

    fn parameters(&self) -> Vec<(&'static str, ArrayViewD<'_, f32>)> {
        vec![
            ("weight", self.weight.view().into_dyn()),
            ("bias", self.bias.view().into_dyn()),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, ArrayViewMutD<'_, f32>)> {
        vec![
            ("weight", self.weight.view_mut().into_dyn()),
            ("bias", self.bias.view_mut().into_dyn()),
        ]
    }
}

/// Build all ten canonical stages with seeded initialisation.
pub fn reference_stages(
    in_channels: usize,
    n_classes: usize,
    reduction: f32,
    seed: u64,
) -> Vec<(StageName, Box<dyn StageTransform>)> {
    let mut rng = StdRng::seed_from_u64(seed);
    StageName::ORDERED
        .iter()
        .map(|&name| {
            let fan_in = name.input_channels(in_channels, n_classes, reduction);
            let fan_out = name.channels(n_classes, reduction);
            let transform: Box<dyn StageTransform> = if name.is_encoder() {
                Box::new(EncoderStage::new(fan_in, fan_out, &mut rng))
            } else {
                Box::new(DecoderStage::new(
                    fan_in,
                    fan_out,
                    name != StageName::Up1,
                    &mut rng,
                ))
            };
            (name, transform)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_encoder_pools_and_records_indices() {
        let weight = array![[1.0f32]];
        let bias = array![0.0f32];
        let stage = EncoderStage::from_parameters(weight, bias).unwrap();

        let mut input = Tensor4::zeros((1, 1, 2, 4));
        input[[0, 0, 1, 0]] = 3.0;
        input[[0, 0, 0, 3]] = 5.0;
        let out = stage.forward(&input, None).unwrap();

        assert_eq!(out.activation.dim(), (1, 1, 1, 2));
        assert_eq!(out.activation[[0, 0, 0, 0]], 3.0);
        assert_eq!(out.activation[[0, 0, 0, 1]], 5.0);
        let pool = out.pool.unwrap();
        assert_eq!(pool.argmax[[0, 0, 0, 0]], 2);
        assert_eq!(pool.argmax[[0, 0, 0, 1]], 1);
    }

    #[test]
    fn test_unpool_restores_positions() {
        let mut rng = StdRng::seed_from_u64(1);
        let encoder = EncoderStage::new(2, 2, &mut rng);
        let input = Tensor4::from_shape_fn((1, 2, 4, 4), |(_, c, r, w)| (c + r * 4 + w) as f32);
        let encoded = encoder.forward(&input, None).unwrap();
        let pool = encoded.pool.unwrap();

        let unpooled = max_unpool2(&encoded.activation, &pool).unwrap();
        assert_eq!(unpooled.dim(), (1, 2, 4, 4));
        let nonzero = unpooled.iter().filter(|v| **v != 0.0).count();
        assert!(nonzero <= 8);
    }

    #[test]
    fn test_decoder_requires_indices() {
        let mut rng = StdRng::seed_from_u64(1);
        let decoder = DecoderStage::new(2, 3, false, &mut rng);
        let input = Tensor4::ones((1, 2, 2, 2));
        assert!(decoder.forward(&input, None).is_err());
    }

    #[test]
    fn test_mix_channels_rejects_wrong_width() {
        let weight = Array2::<f32>::ones((4, 3));
        let bias = Array1::<f32>::zeros(4);
        let input = Tensor4::ones((1, 2, 2, 2));
        assert!(matches!(
            mix_channels(&input, &weight, &bias),
            Err(SegError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_reference_stages_chain_channels() {
        let stages = reference_stages(3, 5, 0.125, 7);
        assert_eq!(stages.len(), 10);
        for pair in stages.windows(2) {
            assert_eq!(pair[0].1.out_channels(), pair[1].1.in_channels());
        }
        assert_eq!(stages[9].1.out_channels(), 5);
        assert_eq!(stages[0].1.in_channels(), 3);
    }
}
