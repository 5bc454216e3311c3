pub mod color;
pub mod display;
pub mod markdown;
pub mod renderer;
pub mod skeleton;

pub use color::{
    AvatarColors, ColorPersister, ColorSampler, ColorTarget, FileColorPersister, ImageColorSampler,
    NoopColorPersister,
};
pub use display::{DisplayList, DisplaySurface};
pub use markdown::{CmarkEngine, MarkdownEngine};
pub use renderer::MessageRenderer;
pub use skeleton::{build_skeleton, AttachmentNode, AvatarNode, Layout, MessageNode, NameNode};
