//! 帧图执行期的资源与同步管理
//!
//! 输入是外部帧图编译器产出的资源/placement 列表和绑定命令流，
//! 输出是发往 `GfxRecorder` 的 barrier/clear/copy/draw 序列。
//! 单线程录制，每帧的池子只 reset 不销毁。

pub mod binding;
pub mod descriptors;
pub mod frame;
pub mod handle;
pub mod mock_gfx;
pub mod pipeline;
pub mod registry;
pub mod staging;
pub mod state_tracker;
pub mod transient;
