use std::sync::Arc;

/// Supplies the extension a transform appends to an artifact name (`gz`, `age`, ...).
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}
