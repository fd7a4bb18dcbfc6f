mod frame_allocator;
mod frame_window;

pub use frame_allocator::FrameTable;
pub use frame_window::FrameWindow;
