use serde_json::Value;

use crate::error::InferenceError;

/// Motor de inferencia: bytes de entrada, bytes de salida. Corre en un hilo
/// de bloqueo, así que puede tardar lo que necesite.
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, input: &[u8]) -> Result<Vec<u8>, InferenceError>;
}

pub const DEFAULT_MAX_VALUES: usize = 1 << 20;

/// Preprocesamiento de imagen: escala cada valor de píxel a `[0, 1]`.
///
/// Acepta un array JSON de números o `{"input": [...]}` y devuelve el array
/// escalado.
#[derive(Debug, Clone)]
pub struct NormalizeEngine {
    max_values: usize,
}

impl Default for NormalizeEngine {
    fn default() -> Self {
        Self {
            max_values: DEFAULT_MAX_VALUES,
        }
    }
}

impl NormalizeEngine {
    #[cfg(test)]
    pub fn with_max_values(max_values: usize) -> Self {
        Self { max_values }
    }
}

impl InferenceEngine for NormalizeEngine {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn execute(&self, input: &[u8]) -> Result<Vec<u8>, InferenceError> {
        let value: Value = serde_json::from_slice(input)
            .map_err(|e| InferenceError::InvalidInput(format!("JSON inválido: {}", e)))?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("input") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(InferenceError::InvalidInput(
                        "se esperaba {\"input\": [...]}".into(),
                    ))
                }
            },
            _ => {
                return Err(InferenceError::InvalidInput(
                    "se esperaba un array de números".into(),
                ))
            }
        };

        if items.len() > self.max_values {
            return Err(InferenceError::ResourceExhausted {
                len: items.len(),
                max: self.max_values,
            });
        }

        let scaled = items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64()
                    .map(|x| x / 255.0)
                    .ok_or_else(|| InferenceError::InvalidInput(format!("posición {} no es numérica", i)))
            })
            .collect::<Result<Vec<f64>, _>>()?;

        serde_json::to_vec(&scaled).map_err(|e| InferenceError::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> Result<Vec<f64>, InferenceError> {
        let out = NormalizeEngine::default().execute(input.as_bytes())?;
        Ok(serde_json::from_slice(&out).unwrap())
    }

    #[test]
    fn normaliza_array_plano() {
        assert_eq!(run("[0, 255, 51]").unwrap(), vec![0.0, 1.0, 0.2]);
    }

    #[test]
    fn acepta_objeto_con_input() {
        assert_eq!(run(r#"{"input": [255]}"#).unwrap(), vec![1.0]);
        assert_eq!(run("[]").unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn rechaza_entradas_invalidas() {
        assert!(matches!(run("hola"), Err(InferenceError::InvalidInput(_))));
        assert!(matches!(run(r#"{"x": 1}"#), Err(InferenceError::InvalidInput(_))));
        assert!(matches!(run(r#"[1, "a"]"#), Err(InferenceError::InvalidInput(_))));
        assert!(matches!(run("3"), Err(InferenceError::InvalidInput(_))));
    }

    #[test]
    fn entrada_demasiado_grande() {
        let engine = NormalizeEngine::with_max_values(2);
        assert_eq!(
            engine.execute(b"[1,2,3]"),
            Err(InferenceError::ResourceExhausted { len: 3, max: 2 })
        );
    }
}
