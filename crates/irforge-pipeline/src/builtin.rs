//! Extractors for the operations every supported model may contain.

use crate::{
    AttrValue, ElementType, ExtractedAttributes, ExtractorRegistry, PipelineError, RawNode,
    TensorValue,
};

type ExtractFn = fn(&RawNode) -> Result<ExtractedAttributes, String>;

const BUILTIN_EXTRACTORS: &[(&str, ExtractFn)] = &[
    ("Const", extract_const),
    ("Placeholder", extract_placeholder),
    ("Identity", extract_identity),
    ("NoOp", extract_noop),
    ("Add", extract_eltwise_sum),
    ("AddV2", extract_eltwise_sum),
    ("BiasAdd", extract_eltwise_sum),
    ("Sub", extract_eltwise_sub),
    ("Mul", extract_eltwise_mul),
    ("RealDiv", extract_eltwise_div),
    ("Maximum", extract_eltwise_max),
    ("MatMul", extract_matmul),
    ("Conv2D", extract_conv2d),
    ("MaxPool", extract_max_pool),
    ("AvgPool", extract_avg_pool),
    ("Relu", extract_relu),
    ("Relu6", extract_relu6),
    ("Sigmoid", extract_sigmoid),
    ("Tanh", extract_tanh),
    ("Softmax", extract_softmax),
    ("Reshape", extract_reshape),
    ("ConcatV2", extract_concat),
    ("Squeeze", extract_squeeze),
];

pub fn builtin_extractors() -> Result<ExtractorRegistry, PipelineError> {
    let mut registry = ExtractorRegistry::new();
    for (op, extractor) in BUILTIN_EXTRACTORS {
        registry.register_builtin(*op, *extractor)?;
    }
    Ok(registry)
}

fn typed(ir_type: &str) -> ExtractedAttributes {
    ExtractedAttributes::from([("type".to_string(), AttrValue::String(ir_type.to_string()))])
}

fn eltwise(operation: &str) -> ExtractedAttributes {
    let mut attrs = typed("Eltwise");
    attrs.insert(
        "operation".to_string(),
        AttrValue::String(operation.to_string()),
    );
    attrs
}

fn element_type(node: &RawNode, key: &str) -> Result<Option<ElementType>, String> {
    match node.attrs.get(key) {
        None => Ok(None),
        Some(AttrValue::String(value)) => value.parse().map(Some),
        Some(other) => Err(format!(
            "attribute '{key}' must name an element type, got {}",
            other.to_string_value()
        )),
    }
}

fn int_list(node: &RawNode, key: &str) -> Result<Option<Vec<i64>>, String> {
    match node.attrs.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_i64_list()
            .map(Some)
            .ok_or_else(|| format!("attribute '{key}' must be a list of integers")),
    }
}

fn four_ints(node: &RawNode, key: &str, default: [i64; 4]) -> Result<Vec<i64>, String> {
    let values = int_list(node, key)?.unwrap_or_else(|| default.to_vec());
    if values.len() != 4 {
        return Err(format!(
            "attribute '{key}' must have 4 elements, got {}",
            values.len()
        ));
    }
    Ok(values)
}

fn bool_attr(node: &RawNode, key: &str) -> Result<bool, String> {
    match node.attrs.get(key) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| format!("attribute '{key}' must be a boolean")),
    }
}

fn data_format(node: &RawNode) -> Result<String, String> {
    match node.attrs.get("data_format") {
        None => Ok("NHWC".to_string()),
        Some(AttrValue::String(value)) if value == "NHWC" || value == "NCHW" => Ok(value.clone()),
        Some(other) => Err(format!(
            "unsupported data_format {}",
            other.to_string_value()
        )),
    }
}

fn auto_pad(node: &RawNode) -> Result<String, String> {
    match node.attrs.get("padding").and_then(AttrValue::as_str) {
        Some("SAME") => Ok("same_upper".to_string()),
        Some("VALID") => Ok("valid".to_string()),
        Some(other) => Err(format!("unsupported padding '{other}'")),
        None => Err("attribute 'padding' is required".to_string()),
    }
}

/// Keeps the spatial dimensions of a framework 4-element attribute.
fn spatial(values: &[i64], layout: &str) -> AttrValue {
    let spatial = if layout == "NCHW" {
        &values[2..4]
    } else {
        &values[1..3]
    };
    AttrValue::int_list(spatial.iter().copied())
}

fn tensor_from(value: &AttrValue, dtype: Option<ElementType>) -> Result<TensorValue, String> {
    match value {
        AttrValue::Tensor(tensor) => Ok(tensor.clone()),
        AttrValue::List(values) => {
            let data = values
                .iter()
                .map(|value| value.as_f64().ok_or("constant list must be numeric"))
                .collect::<Result<Vec<_>, _>>()?;
            let element_type = dtype.unwrap_or_else(|| {
                if values.iter().all(|value| value.as_i64().is_some()) {
                    ElementType::I64
                } else {
                    ElementType::F32
                }
            });
            Ok(TensorValue::new(element_type, vec![data.len() as i64], data))
        }
        AttrValue::Integer(value) => Ok(TensorValue::new(
            dtype.unwrap_or(ElementType::I64),
            Vec::new(),
            vec![*value as f64],
        )),
        AttrValue::Float(value) => Ok(TensorValue::new(
            dtype.unwrap_or(ElementType::F32),
            Vec::new(),
            vec![*value],
        )),
        other => Err(format!(
            "constant value {} is not numeric",
            other.to_string_value()
        )),
    }
}

fn extract_const(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let value = node
        .attrs
        .get("value")
        .ok_or("attribute 'value' is required")?;
    let tensor = tensor_from(value, element_type(node, "dtype")?)?;
    let expected = tensor.shape_element_count()?;
    if expected != tensor.element_count() {
        return Err(format!(
            "constant shape {:?} needs {expected} elements, got {}",
            tensor.shape,
            tensor.element_count()
        ));
    }

    let mut attrs = typed("Const");
    attrs.insert(
        "element_type".to_string(),
        AttrValue::String(tensor.element_type.as_str().to_string()),
    );
    attrs.insert(
        "shape".to_string(),
        AttrValue::int_list(tensor.shape.iter().copied()),
    );
    attrs.insert("value".to_string(), AttrValue::Tensor(tensor));
    Ok(attrs)
}

fn extract_placeholder(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = typed("Parameter");
    let element_type = element_type(node, "dtype")?.unwrap_or(ElementType::F32);
    attrs.insert(
        "element_type".to_string(),
        AttrValue::String(element_type.as_str().to_string()),
    );
    if let Some(shape) = int_list(node, "shape")? {
        attrs.insert("shape".to_string(), AttrValue::int_list(shape));
    }
    Ok(attrs)
}

fn extract_identity(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(typed("Identity"))
}

fn extract_noop(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(typed("NoOp"))
}

fn extract_eltwise_sum(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(eltwise("sum"))
}

fn extract_eltwise_sub(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(eltwise("sub"))
}

fn extract_eltwise_mul(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(eltwise("mul"))
}

fn extract_eltwise_div(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(eltwise("div"))
}

fn extract_eltwise_max(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(eltwise("max"))
}

fn extract_matmul(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = typed("MatMul");
    attrs.insert(
        "transpose_a".to_string(),
        AttrValue::Boolean(bool_attr(node, "transpose_a")?),
    );
    attrs.insert(
        "transpose_b".to_string(),
        AttrValue::Boolean(bool_attr(node, "transpose_b")?),
    );
    Ok(attrs)
}

fn extract_conv2d(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let layout = data_format(node)?;
    let strides = four_ints(node, "strides", [1, 1, 1, 1])?;
    let dilations = four_ints(node, "dilations", [1, 1, 1, 1])?;

    let mut attrs = typed("Convolution");
    attrs.insert("strides".to_string(), spatial(&strides, &layout));
    attrs.insert("dilations".to_string(), spatial(&dilations, &layout));
    attrs.insert("auto_pad".to_string(), AttrValue::String(auto_pad(node)?));
    attrs.insert("layout".to_string(), AttrValue::String(layout));
    Ok(attrs)
}

fn extract_pool(node: &RawNode, method: &str) -> Result<ExtractedAttributes, String> {
    let layout = data_format(node)?;
    let kernel = four_ints(node, "ksize", [1, 1, 1, 1])?;
    let strides = four_ints(node, "strides", [1, 1, 1, 1])?;

    let mut attrs = typed("Pooling");
    attrs.insert(
        "pool_method".to_string(),
        AttrValue::String(method.to_string()),
    );
    attrs.insert("kernel".to_string(), spatial(&kernel, &layout));
    attrs.insert("strides".to_string(), spatial(&strides, &layout));
    attrs.insert("auto_pad".to_string(), AttrValue::String(auto_pad(node)?));
    attrs.insert("layout".to_string(), AttrValue::String(layout));
    Ok(attrs)
}

fn extract_max_pool(node: &RawNode) -> Result<ExtractedAttributes, String> {
    extract_pool(node, "max")
}

fn extract_avg_pool(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = extract_pool(node, "avg")?;
    attrs.insert("exclude_pad".to_string(), AttrValue::Boolean(true));
    Ok(attrs)
}

fn extract_relu(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(typed("ReLU"))
}

fn extract_relu6(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = typed("Clamp");
    attrs.insert("min".to_string(), AttrValue::Float(0.0));
    attrs.insert("max".to_string(), AttrValue::Float(6.0));
    Ok(attrs)
}

fn extract_sigmoid(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(typed("Sigmoid"))
}

fn extract_tanh(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    Ok(typed("TanH"))
}

fn extract_softmax(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let axis = match node.attrs.get("axis") {
        None => -1,
        Some(value) => value.as_i64().ok_or("attribute 'axis' must be an integer")?,
    };
    let mut attrs = typed("SoftMax");
    attrs.insert("axis".to_string(), AttrValue::Integer(axis));
    Ok(attrs)
}

fn extract_reshape(_node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = typed("Reshape");
    attrs.insert("special_zero".to_string(), AttrValue::Boolean(false));
    Ok(attrs)
}

fn extract_concat(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let data_inputs = node
        .inputs
        .iter()
        .filter(|input| !input.starts_with('^'))
        .count();
    if data_inputs < 2 {
        return Err("ConcatV2 needs at least one value input and an axis input".to_string());
    }
    let mut attrs = typed("Concat");
    attrs.insert(
        "value_inputs".to_string(),
        AttrValue::Integer(data_inputs as i64 - 1),
    );
    Ok(attrs)
}

fn extract_squeeze(node: &RawNode) -> Result<ExtractedAttributes, String> {
    let mut attrs = typed("Squeeze");
    if let Some(dims) = int_list(node, "squeeze_dims")? {
        attrs.insert("squeeze_dims".to_string(), AttrValue::int_list(dims));
    }
    Ok(attrs)
}
