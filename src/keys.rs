// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Key and tag naming.
//!
//! Keeping every key shape in one place is what makes namespace policies
//! and orphan detection work: a key built here always lands in a
//! configured namespace.
//!
//! ```
//! use cache_engine::keys::{self, CacheKeys};
//!
//! let k = CacheKeys::new("scope:");
//! assert_eq!(k.player_power(42), "scope:player:power:42");
//! assert_eq!(k.leaderboard("power", 1), "scope:leaderboard:power:page:1");
//! assert_eq!(keys::player_tag(42), "player:42");
//! assert_eq!(keys::player_tags(42).len(), 5);
//! ```

/// Tag for everything derived from global game state.
pub const GLOBAL_TAG: &str = "global";

/// Builds cache keys under a fixed prefix.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn player_power(&self, player_id: u64) -> String {
        format!("{}player:power:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn leader_bonuses(&self, player_id: u64) -> String {
        format!("{}player:leader_bonuses:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn collection_stats(&self, player_id: u64) -> String {
        format!("{}player:collection:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn quest_data(&self, player_id: u64) -> String {
        format!("{}player:quests:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn achievement_progress(&self, player_id: u64) -> String {
        format!("{}player:achievements:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn leaderboard(&self, board: &str, page: u32) -> String {
        format!("{}leaderboard:{board}:page:{page}", self.prefix)
    }

    #[must_use]
    pub fn shop_data(&self, player_id: u64) -> String {
        format!("{}shop:{player_id}", self.prefix)
    }

    #[must_use]
    pub fn guild_data(&self, guild_id: u64) -> String {
        format!("{}guild:{guild_id}", self.prefix)
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        format!("{}session:{session_id}", self.prefix)
    }

    #[must_use]
    pub fn temp(&self, name: &str) -> String {
        format!("{}temp:{name}", self.prefix)
    }

    /// Glob over every key of one player, for pattern deletes.
    #[must_use]
    pub fn player_pattern(&self, player_id: u64) -> String {
        format!("{}player:*:{player_id}", self.prefix)
    }
}

#[must_use]
pub fn player_tag(player_id: u64) -> String {
    format!("player:{player_id}")
}

#[must_use]
pub fn collection_tag(player_id: u64) -> String {
    format!("collection:{player_id}")
}

#[must_use]
pub fn combat_tag(player_id: u64) -> String {
    format!("combat:{player_id}")
}

#[must_use]
pub fn economic_tag(player_id: u64) -> String {
    format!("economic:{player_id}")
}

#[must_use]
pub fn social_tag(player_id: u64) -> String {
    format!("social:{player_id}")
}

#[must_use]
pub fn guild_tag(guild_id: u64) -> String {
    format!("guild:{guild_id}")
}

/// Every tag a player's entries may carry.
#[must_use]
pub fn player_tags(player_id: u64) -> Vec<String> {
    vec![
        player_tag(player_id),
        collection_tag(player_id),
        combat_tag(player_id),
        economic_tag(player_id),
        social_tag(player_id),
    ]
}
