//! Almacenamiento durable clave → bytes.
//!
//! Lo usa el coordinador para persistir salidas finales y el nodo para su
//! outbox de resultados sin ACK. Sin transacciones: gana la última escritura.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::StorageError;

pub trait Storage: Send + Sync {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// `Ok(None)` si la clave no existe.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Borra todas las claves que empiezan con `prefix`; devuelve cuántas.
    fn delete_all(&self, prefix: &str) -> Result<usize, StorageError>;

    /// Claves bajo `prefix`, ordenadas.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Valida que la clave sea una ruta relativa sin `..` ni componentes vacíos.
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for part in key.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }
    Ok(())
}

/// Storage sobre un directorio; cada clave es un archivo (las `/` son subdirectorios).
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!("storage en {}", root.display());
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<(), StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            // temporales de escrituras a medio terminar
            if name.ends_with(".tmp") {
                continue;
            }
            let key = if rel.is_empty() {
                name
            } else {
                format!("{}/{}", rel, name)
            };
            let ft = entry.file_type()?;
            if ft.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else if ft.is_file() {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl Storage for FsStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // escribir a un temporal y renombrar: un lector nunca ve un archivo a medias
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        debug!("storage: escrito {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_all(&self, prefix: &str) -> Result<usize, StorageError> {
        let keys = self.keys(prefix)?;
        for key in &keys {
            self.delete(key)?;
        }
        debug!("storage: borradas {} claves con prefijo {:?}", keys.len(), prefix);
        Ok(keys.len())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        self.collect_keys(&self.root, "", &mut out)?;
        out.retain(|k| k.starts_with(prefix));
        out.sort();
        Ok(out)
    }
}

/// Storage en memoria, para tests y para correr sin disco.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // un panic con el lock tomado no deja el mapa a medio modificar
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock().remove(key);
        Ok(())
    }

    fn delete_all(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_storage() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    #[test]
    fn fs_escribe_lee_y_sobrescribe() {
        let (_dir, s) = fs_storage();
        s.write("results/b1.json", b"uno").unwrap();
        assert_eq!(s.read("results/b1.json").unwrap(), Some(b"uno".to_vec()));

        s.write("results/b1.json", b"dos").unwrap();
        assert_eq!(s.read("results/b1.json").unwrap(), Some(b"dos".to_vec()));
        assert_eq!(s.read("results/nada.json").unwrap(), None);
    }

    #[test]
    fn fs_keys_y_delete_all_por_prefijo() {
        let (_dir, s) = fs_storage();
        s.write("outbox/t1", b"a").unwrap();
        s.write("outbox/t2", b"b").unwrap();
        s.write("tasks/t1", b"c").unwrap();

        assert_eq!(s.keys("outbox/").unwrap(), vec!["outbox/t1", "outbox/t2"]);
        assert_eq!(s.delete_all("outbox/").unwrap(), 2);
        assert!(s.keys("outbox/").unwrap().is_empty());
        assert_eq!(s.keys("").unwrap(), vec!["tasks/t1"]);
    }

    #[test]
    fn fs_delete_de_clave_inexistente_no_falla() {
        let (_dir, s) = fs_storage();
        s.delete("outbox/fantasma").unwrap();
    }

    #[test]
    fn claves_con_traversal_se_rechazan() {
        let (_dir, s) = fs_storage();
        for bad in ["../fuera", "/abs", "a//b", "a/./b", "", "dir/"] {
            assert!(
                matches!(s.write(bad, b"x"), Err(StorageError::InvalidKey(_))),
                "clave {:?} debió rechazarse",
                bad
            );
        }
    }

    #[test]
    fn memoria_se_comporta_igual() {
        let s = MemoryStorage::new();
        s.write("outbox/t1", b"a").unwrap();
        s.write("outbox/t2", b"b").unwrap();
        s.write("results/x", b"c").unwrap();
        assert_eq!(s.keys("outbox/").unwrap().len(), 2);
        assert_eq!(s.delete_all("outbox/").unwrap(), 2);
        assert_eq!(s.read("results/x").unwrap(), Some(b"c".to_vec()));
        assert!(s.write("../x", b"").is_err());
    }
}
