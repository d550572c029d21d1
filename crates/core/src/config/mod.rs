//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `TASKBEAT__SECTION__KEY` 环境变量。
//! 每个配置段都提供 `validate()`，`AppConfig::load` 在返回前完成整体校验。

pub mod models;

pub use models::*;
