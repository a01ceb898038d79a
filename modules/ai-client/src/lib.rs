pub mod openai;
pub mod traits;
pub mod util;

pub use openai::OpenAi;
pub use traits::{ChatModel, Message, MessageRole};
pub use util::{strip_code_blocks, truncate_to_char_boundary};
