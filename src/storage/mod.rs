// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage backends: Redis (fast path), SQL (ground truth), in-memory.

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
