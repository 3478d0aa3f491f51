use anyhow::{bail, ensure, Context, Result};
use modelport_core::{
    DType, Device, EagerModel, EagerRuntime, IOName, OptimizationLevel, SavedModelExport,
    SessionConfig, Tensor, TensorMap, TensorSpec,
};
use ort::{
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session, SessionInputValue,
    },
    tensor::TensorElementType,
    value::{DynValue, ValueType},
};
use tracing::info;

mod graph;

pub use graph::OrtGraphSession;

/// ONNX model metadata key holding the training step the export was written at.
pub const GLOBAL_STEP_METADATA_KEY: &str = "global_step";

/// ONNX Runtime over `<export>/model.onnx`, usable as both an eager and a
/// graph runtime.
#[derive(Clone, Debug, Default)]
pub struct OrtRuntime {
    config: SessionConfig,
}

impl OrtRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session options for eager models. Graph sessions take theirs from the
    /// predictor.
    pub fn with_config(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

pub struct OrtModel {
    session: Session,
    inputs: Vec<TensorSpec>,
    outputs: Vec<TensorSpec>,
    global_step: Option<i64>,
}

impl OrtModel {
    pub fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }
}

impl EagerRuntime for OrtRuntime {
    type Model = OrtModel;

    fn name(&self) -> &'static str {
        "onnxruntime"
    }

    fn load(&self, export: &SavedModelExport) -> Result<Self::Model> {
        let session = open_session(export, &self.config)?;
        let (inputs, outputs) = io_specs(&session)?;
        let global_step = recorded_global_step(&session, export)?;

        info!(
            path = %export.path().display(),
            device = %self.config.device,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "ONNX model loaded"
        );

        Ok(OrtModel {
            session,
            inputs,
            outputs,
            global_step,
        })
    }
}

impl EagerModel for OrtModel {
    fn call(&mut self, mut inputs: TensorMap) -> Result<TensorMap> {
        let mut ort_inputs = Vec::with_capacity(self.inputs.len());
        for spec in &self.inputs {
            let name = &spec.name.0;
            let tensor = inputs
                .remove(name)
                .with_context(|| format!("missing model input `{name}`"))?;
            ensure!(
                tensor.dtype == spec.dtype,
                "input `{name}` has dtype {}, model expects {}",
                tensor.dtype,
                spec.dtype
            );
            let value = tensor_to_ort_value(tensor)?;
            ort_inputs.push((name.clone(), SessionInputValue::from(value)));
        }
        ensure!(
            inputs.is_empty(),
            "model has no inputs named {:?}",
            inputs.keys().collect::<Vec<_>>()
        );

        let outputs = self.session.run(ort_inputs)?;
        let mut out = TensorMap::new();
        for (name, value) in outputs.iter() {
            out.insert(name.to_string(), ort_value_to_tensor(&value)?);
        }

        Ok(out)
    }

    fn global_step(&mut self) -> Result<Option<Tensor>> {
        Ok(self.global_step.map(Tensor::scalar))
    }
}

pub(crate) fn open_session(export: &SavedModelExport, config: &SessionConfig) -> Result<Session> {
    let model_file = export.model_file();

    let builder = Session::builder()
        .context("failed to create ORT session builder")?
        .with_optimization_level(optimization_level(config.optimization))
        .context("failed to configure ORT session builder")?
        .with_intra_threads(config.intra_threads)
        .context("failed to configure ORT intra-op threads")?;

    let builder = configure_session_builder(builder, &config.device)?;

    builder
        .commit_from_file(&model_file)
        .with_context(|| format!("failed to load ONNX model from {}", model_file.display()))
}

/// Prefers the step recorded in the model itself, then the export's sidecar.
pub(crate) fn recorded_global_step(
    session: &Session,
    export: &SavedModelExport,
) -> Result<Option<i64>> {
    let metadata = session
        .metadata()
        .context("failed to read ONNX model metadata")?;
    let custom = metadata
        .custom(GLOBAL_STEP_METADATA_KEY)
        .context("failed to read ONNX custom metadata")?;
    if let Some(raw) = custom {
        let step = raw
            .trim()
            .parse()
            .with_context(|| format!("invalid global_step metadata value {raw:?}"))?;
        return Ok(Some(step));
    }

    Ok(export.load_assets()?.global_step)
}

pub(crate) fn io_specs(session: &Session) -> Result<(Vec<TensorSpec>, Vec<TensorSpec>)> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| tensor_spec_from_value_type(&input.name, &input.input_type))
        .collect::<Result<Vec<_>>>()?;

    let outputs = session
        .outputs
        .iter()
        .map(|output| tensor_spec_from_value_type(&output.name, &output.output_type))
        .collect::<Result<Vec<_>>>()?;

    Ok((inputs, outputs))
}

fn optimization_level(level: OptimizationLevel) -> GraphOptimizationLevel {
    match level {
        OptimizationLevel::Disable => GraphOptimizationLevel::Disable,
        OptimizationLevel::Level1 => GraphOptimizationLevel::Level1,
        OptimizationLevel::Level2 => GraphOptimizationLevel::Level2,
        OptimizationLevel::Level3 => GraphOptimizationLevel::Level3,
    }
}

fn configure_session_builder(builder: SessionBuilder, device: &Device) -> Result<SessionBuilder> {
    match device {
        Device::Cpu => Ok(builder),
        Device::Cuda { device_id } => configure_cuda(builder, *device_id),
    }
}

fn configure_cuda(builder: SessionBuilder, device_id: u32) -> Result<SessionBuilder> {
    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::cuda::CUDAExecutionProvider;
        let ep = CUDAExecutionProvider::default()
            .with_device_id(device_id as i32)
            .build();
        builder
            .with_execution_providers([ep])
            .context("failed to enable ORT CUDA execution provider")
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = (builder, device_id);
        bail!("CUDA requested but modelport-backend-ort was built without the `cuda` feature")
    }
}

fn tensor_spec_from_value_type(name: &str, value_type: &ValueType) -> Result<TensorSpec> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        bail!("unsupported non-tensor IO value type for `{name}`");
    };

    let dims = shape
        .iter()
        .map(|d| if *d < 0 { None } else { Some(*d as usize) })
        .collect::<Vec<_>>();

    Ok(TensorSpec {
        name: IOName(name.to_string()),
        dtype: ort_tensor_element_to_dtype(*ty)?,
        dims,
        is_optional: false,
    })
}

fn ort_tensor_element_to_dtype(ty: TensorElementType) -> Result<DType> {
    match ty {
        TensorElementType::Float32 => Ok(DType::F32),
        TensorElementType::Int64 => Ok(DType::I64),
        TensorElementType::Int32 => Ok(DType::I32),
        TensorElementType::Uint8 => Ok(DType::U8),
        _ => bail!("unsupported tensor element type: {ty}"),
    }
}

pub(crate) fn tensor_to_ort_value(tensor: Tensor) -> Result<DynValue> {
    let shape: Vec<usize> = tensor.shape.dims().to_vec();

    let value = match tensor.dtype {
        DType::F32 => {
            let data = tensor.to_vec::<f32>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I64 => {
            let data = tensor.to_vec::<i64>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::I32 => {
            let data = tensor.to_vec::<i32>()?;
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
        DType::U8 => {
            let data = tensor.data.to_vec();
            ort::value::Tensor::from_array((shape, data))?.into_dyn()
        }
    };

    Ok(value)
}

pub(crate) fn ort_value_to_tensor(value: &ort::value::ValueRef<'_>) -> Result<Tensor> {
    let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
        bail!("non-tensor outputs are not supported");
    };

    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();

    match *ty {
        TensorElementType::Float32 => {
            let array = value.try_extract_array::<f32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Tensor::from_vec(&dims, slice)
        }
        TensorElementType::Int64 => {
            let array = value.try_extract_array::<i64>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Tensor::from_vec(&dims, slice)
        }
        TensorElementType::Int32 => {
            let array = value.try_extract_array::<i32>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Tensor::from_vec(&dims, slice)
        }
        TensorElementType::Uint8 => {
            let array = value.try_extract_array::<u8>()?;
            let slice = array.as_slice().context("non-contiguous output tensor")?;
            Tensor::from_vec(&dims, slice)
        }
        _ => bail!("unsupported output tensor element type: {ty}"),
    }
}
