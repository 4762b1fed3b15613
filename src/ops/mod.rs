// ============================================================================
// Editing operations — one module per pipeline
// ============================================================================

pub mod background;
pub mod enhance;
pub mod inpaint;
pub mod refine;
pub mod restore;

use std::collections::HashMap;

use crate::engine::Tensor;
use crate::error::EditError;

/// Pull the tensor a pipeline expects out of a run's output map: the first
/// preferred name that is present, or — when the model has exactly one
/// output — that output whatever its name.
pub(crate) fn pick_output(
    outputs: &mut HashMap<String, Tensor>,
    preferred: &[&str],
) -> Result<Tensor, EditError> {
    for name in preferred {
        if let Some(t) = outputs.remove(*name) {
            return Ok(t);
        }
    }
    if outputs.len() == 1 {
        let key = outputs.keys().next().cloned().unwrap();
        return Ok(outputs.remove(&key).unwrap());
    }
    let mut names: Vec<&String> = outputs.keys().collect();
    names.sort();
    Err(EditError::InvalidOutput(format!(
        "none of {:?} found among outputs {:?}",
        preferred, names
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_output_prefers_named_then_falls_back_to_single() {
        let mut m = HashMap::new();
        m.insert("masks".to_string(), Tensor::f32(vec![1], vec![1.0]));
        m.insert("scores".to_string(), Tensor::f32(vec![1], vec![2.0]));
        let t = pick_output(&mut m, &["masks"]).unwrap();
        assert_eq!(t.as_f32(), Some(&[1.0f32][..]));

        let mut single = HashMap::new();
        single.insert("whatever".to_string(), Tensor::f32(vec![1], vec![3.0]));
        let t = pick_output(&mut single, &["output"]).unwrap();
        assert_eq!(t.as_f32(), Some(&[3.0f32][..]));

        let mut multi = HashMap::new();
        multi.insert("a".to_string(), Tensor::f32(vec![1], vec![0.0]));
        multi.insert("b".to_string(), Tensor::f32(vec![1], vec![0.0]));
        assert!(pick_output(&mut multi, &["c"]).is_err());
    }
}
