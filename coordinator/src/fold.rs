// coordinator/src/fold.rs

use common::{ConfigError, TaskId};
use serde_json::{json, Value};

/// Combina las salidas exitosas de un batch en un único valor JSON.
///
/// Recibe los pares ya ordenados por `task_id`; el resultado tiene que
/// depender sólo de esa entrada.
pub trait ResultFold: Send + Sync {
    fn name(&self) -> &'static str;
    fn fold(&self, outputs: &[(&TaskId, &[u8])]) -> Value;
}

/// Salida de un nodo como JSON; si no parsea, como texto.
fn decode_output(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Todos los números de una salida: un número suelto, un array (aplanado) o
/// `{"output": ...}`.
fn numbers(value: &Value, out: &mut Vec<f64>) {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.push(f);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| numbers(v, out)),
        Value::Object(map) => {
            if let Some(v) = map.get("output") {
                numbers(v, out);
            }
        }
        _ => {}
    }
}

/// `{task_id: salida}` en orden de id.
#[derive(Debug, Default)]
pub struct ConcatFold;

impl ResultFold for ConcatFold {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn fold(&self, outputs: &[(&TaskId, &[u8])]) -> Value {
        let map = outputs
            .iter()
            .map(|(id, bytes)| ((*id).clone(), decode_output(bytes)))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }
}

/// Suma de todos los valores numéricos.
#[derive(Debug, Default)]
pub struct SumFold;

impl ResultFold for SumFold {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn fold(&self, outputs: &[(&TaskId, &[u8])]) -> Value {
        let mut nums = Vec::new();
        for (_, bytes) in outputs {
            numbers(&decode_output(bytes), &mut nums);
        }
        json!(nums.iter().sum::<f64>())
    }
}

/// Promedio elemento a elemento entre salidas del mismo largo (votación
/// blanda de varios nodos sobre la misma entrada). Si los largos no
/// coinciden, promedio escalar de todos los valores.
#[derive(Debug, Default)]
pub struct MeanFold;

impl ResultFold for MeanFold {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn fold(&self, outputs: &[(&TaskId, &[u8])]) -> Value {
        let vectors: Vec<Vec<f64>> = outputs
            .iter()
            .map(|(_, bytes)| {
                let mut nums = Vec::new();
                numbers(&decode_output(bytes), &mut nums);
                nums
            })
            .filter(|v| !v.is_empty())
            .collect();

        if vectors.is_empty() {
            return Value::Null;
        }

        let width = vectors[0].len();
        if vectors.iter().all(|v| v.len() == width) {
            let n = vectors.len() as f64;
            let mean: Vec<f64> = (0..width)
                .map(|i| vectors.iter().map(|v| v[i]).sum::<f64>() / n)
                .collect();
            return json!(mean);
        }

        let all: Vec<f64> = vectors.into_iter().flatten().collect();
        json!(all.iter().sum::<f64>() / all.len() as f64)
    }
}

pub fn fold_from_name(name: &str) -> Result<Box<dyn ResultFold>, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "concat" => Ok(Box::new(ConcatFold)),
        "sum" => Ok(Box::new(SumFold)),
        "mean" | "average" => Ok(Box::new(MeanFold)),
        _ => Err(ConfigError::Invalid {
            var: "FLEET_FOLD",
            value: name.to_string(),
        }),
    }
}
