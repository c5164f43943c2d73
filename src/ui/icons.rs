//! Shared UI icons with plain-text fallbacks.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static ENGINE: Emoji<'_, '_> = Emoji("🔥 ", "[>]");
pub static MILESTONE: Emoji<'_, '_> = Emoji("📍 ", "*");
pub static CACHED: Emoji<'_, '_> = Emoji("💾 ", "[CACHE]");
