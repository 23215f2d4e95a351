use ndarray::Axis;
use segmentation_core::{LabelMap, SegError, SegResult, Tensor4};

/// Pixel-wise cross-entropy of `logits` against `labels`, averaged over labelled pixels.
///
/// Labels outside `0..n_classes` are ignored. With class weights the average is
/// weighted by the weight of each pixel's true class.
pub fn cross_entropy(logits: &Tensor4, labels: &LabelMap, weights: Option<&[f32]>) -> SegResult<f32> {
    let (batch, n_classes, rows, cols) = logits.dim();
    if labels.dim() != (batch, rows, cols) {
        return Err(SegError::ShapeMismatch {
            context: "cross-entropy labels".to_string(),
            expected: vec![batch, rows, cols],
            actual: labels.shape().to_vec(),
        });
    }
    if let Some(w) = weights {
        if w.len() != n_classes {
            return Err(SegError::ShapeMismatch {
                context: "cross-entropy class weights".to_string(),
                expected: vec![n_classes],
                actual: vec![w.len()],
            });
        }
    }

    let mut total = 0.0f64;
    let mut norm = 0.0f64;
    for (b, sample) in logits.axis_iter(Axis(0)).enumerate() {
        for r in 0..rows {
            for c in 0..cols {
                let target = labels[[b, r, c]];
                if target >= n_classes {
                    continue;
                }
                let pixel = sample.slice(ndarray::s![.., r, c]);
                let max = pixel.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                let log_sum = pixel.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
                let weight = weights.map_or(1.0, |w| w[target]);
                total += f64::from(weight * (log_sum - pixel[target]));
                norm += f64::from(weight);
            }
        }
    }

    if norm == 0.0 {
        return Err(SegError::InsufficientData(
            "no labelled pixels for cross-entropy".to_string(),
        ));
    }
    Ok((total / norm) as f32)
}
