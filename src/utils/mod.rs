pub mod collage;
pub mod media;
pub mod pool;
pub mod retry;
pub mod text;
