use std::{fmt::Write, path::Path};

use anyhow::{Context, Result};
use log::{debug, warn};
use tract_onnx::pb::ModelProto;
use tract_onnx::prelude::{
    Datum, Framework, Graph, InferenceFact, InferenceModelExt, IntoTensor, SimplePlan, Tensor,
    TypedFact, TypedOp, tvec,
};

use crate::preprocess::PreprocessConfig;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX metadata key holding the class-name table in exported detectors.
const NAMES_METADATA_KEY: &str = "names";

/// A synchronous, non-reentrant `tensor -> tensor` inference engine.
///
/// Callers serialize access; implementations do not need interior locking.
pub trait ModelRunner: Send {
    /// Input tensor shape the runner accepts, batch of one.
    fn input_shape(&self) -> [usize; 4];

    /// Dimensions of the first output, fixed for the lifetime of the runner.
    fn output_dims(&self) -> &[usize];

    /// Run one forward pass.
    fn run(&self, input: Tensor) -> Result<Tensor>;

    /// Raw class-name metadata embedded in the model, if any.
    fn embedded_labels(&self) -> Option<&str> {
        None
    }
}

/// `tract-onnx` implementation of [`ModelRunner`].
#[derive(Debug)]
pub struct OnnxModel {
    runnable: RunnableModel,
    output_dims: Vec<usize>,
    input_shape: [usize; 4],
    names_metadata: Option<String>,
}

impl OnnxModel {
    /// Load an ONNX model with its input pinned to `config`'s tensor shape.
    ///
    /// Tries the optimized plan first and falls back to a decluttered graph when
    /// optimization fails. Output dimensions are read from the typed graph or, when
    /// the graph leaves them symbolic, from a warm-up pass on a zero tensor.
    pub fn load<P: AsRef<Path>>(model_path: P, config: &PreprocessConfig) -> Result<Self> {
        let path = model_path.as_ref();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());

        let proto = tract_onnx::onnx()
            .proto_model_for_path(path)
            .map_err(|e| anyhow::anyhow!("failed to read ONNX protobuf: {e}"))
            .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;
        let names_metadata = names_metadata(&proto);
        let input_shape = config.tensor_shape();

        let runnable = match load_runnable_model(&proto, input_shape, true) {
            Ok(model) => {
                debug!("model {} optimized for input {:?}", path.display(), input_shape);
                model
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "model {} failed optimized load ({}); falling back to decluttered graph.\nError chain:\n{}",
                    path.display(),
                    optimize_msg,
                    chain_msg.trim_end()
                );
                load_runnable_model(&proto, input_shape, false).with_context(|| {
                    format!("fallback to decluttered graph failed after optimize error: {optimize_msg}")
                })?
            }
        };

        let output_dims = match static_output_dims(&runnable) {
            Some(dims) => dims,
            None => warm_up_output_dims(&runnable, input_shape)?,
        };
        anyhow::ensure!(
            output_dims.iter().all(|&d| d > 0),
            "model {} has an empty output {:?}",
            path.display(),
            output_dims
        );
        debug!("model {} output dims: {:?}", path.display(), output_dims);

        Ok(Self {
            runnable,
            output_dims,
            input_shape,
            names_metadata,
        })
    }
}

impl ModelRunner for OnnxModel {
    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn output_dims(&self) -> &[usize] {
        &self.output_dims
    }

    fn run(&self, input: Tensor) -> Result<Tensor> {
        anyhow::ensure!(
            input.shape() == self.input_shape,
            "input tensor shape {:?} does not match model input {:?}",
            input.shape(),
            self.input_shape
        );
        let outputs = self
            .runnable
            .run(tvec![input.into()])
            .map_err(|e| anyhow::anyhow!("model execution failed: {e}"))?;
        outputs
            .into_iter()
            .next()
            .map(|value| value.into_tensor())
            .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))
    }

    fn embedded_labels(&self) -> Option<&str> {
        self.names_metadata.as_deref()
    }
}

fn names_metadata(proto: &ModelProto) -> Option<String> {
    proto
        .metadata_props
        .iter()
        .find(|entry| entry.key == NAMES_METADATA_KEY)
        .map(|entry| entry.value.clone())
}

fn load_runnable_model(
    proto: &ModelProto,
    input_shape: [usize; 4],
    optimized: bool,
) -> Result<RunnableModel> {
    let model = tract_onnx::onnx()
        .model_for_proto_model(proto)
        .map_err(|e| anyhow::anyhow!("unable to build graph from ONNX protobuf: {e}"))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(f32::datum_type(), tvec![
                input_shape[0],
                input_shape[1],
                input_shape[2],
                input_shape[3]
            ]),
        )
        .map_err(|e| anyhow::anyhow!("unable to pin model input shape {input_shape:?}: {e}"))?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    }
}

fn static_output_dims(runnable: &RunnableModel) -> Option<Vec<usize>> {
    let fact = runnable.model().output_fact(0).ok()?;
    fact.shape.as_concrete().map(|dims| dims.to_vec())
}

fn warm_up_output_dims(runnable: &RunnableModel, input_shape: [usize; 4]) -> Result<Vec<usize>> {
    debug!("output shape is symbolic; running a warm-up pass to resolve it");
    let zeros = Tensor::zero::<f32>(&input_shape)
        .map_err(|e| anyhow::anyhow!("failed to allocate warm-up tensor: {e}"))?;
    let outputs = runnable
        .run(tvec![zeros.into()])
        .map_err(|e| anyhow::anyhow!("warm-up inference failed: {e}"))?;
    let first = outputs
        .first()
        .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))?;
    Ok(first.shape().to_vec())
}
