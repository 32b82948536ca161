// Holmes is an open source web search engine.
// Copyright (C) 2024 The Holmes Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

pub mod defaults;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct GatherConfig {
    #[serde(default = "defaults::Gather::max_workers")]
    pub max_workers: usize,

    #[serde(default = "defaults::Gather::max_run_time_secs")]
    pub max_run_time_secs: u64,

    #[serde(default = "defaults::Gather::min_server_delay_secs")]
    pub min_server_delay_secs: u64,

    #[serde(default = "defaults::Gather::max_retries")]
    pub max_retries: u8,

    #[serde(default = "defaults::Gather::rec_err_dly1_secs")]
    pub rec_err_dly1_secs: u64,

    #[serde(default = "defaults::Gather::rec_err_dly2_secs")]
    pub rec_err_dly2_secs: u64,

    #[serde(default = "defaults::Gather::rec_err_limit")]
    pub rec_err_limit: u32,

    #[serde(default = "defaults::Gather::max_resolvers")]
    pub max_resolvers: u32,

    #[serde(default = "defaults::Gather::max_bucket_file_size")]
    pub max_bucket_file_size: u64,

    #[serde(default = "defaults::Gather::max_host_count")]
    pub max_host_count: usize,

    #[serde(default = "defaults::Gather::soft_max_obj_count")]
    pub soft_max_obj_count: u32,

    #[serde(default = "defaults::Gather::hard_max_obj_count")]
    pub hard_max_obj_count: u32,

    #[serde(default = "defaults::Gather::doc_change_mix")]
    pub doc_change_mix: u32,

    #[serde(default = "defaults::Gather::auto_sync")]
    pub auto_sync: u32,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            max_workers: defaults::Gather::max_workers(),
            max_run_time_secs: defaults::Gather::max_run_time_secs(),
            min_server_delay_secs: defaults::Gather::min_server_delay_secs(),
            max_retries: defaults::Gather::max_retries(),
            rec_err_dly1_secs: defaults::Gather::rec_err_dly1_secs(),
            rec_err_dly2_secs: defaults::Gather::rec_err_dly2_secs(),
            rec_err_limit: defaults::Gather::rec_err_limit(),
            max_resolvers: defaults::Gather::max_resolvers(),
            max_bucket_file_size: defaults::Gather::max_bucket_file_size(),
            max_host_count: defaults::Gather::max_host_count(),
            soft_max_obj_count: defaults::Gather::soft_max_obj_count(),
            hard_max_obj_count: defaults::Gather::hard_max_obj_count(),
            doc_change_mix: defaults::Gather::doc_change_mix(),
            auto_sync: defaults::Gather::auto_sync(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ResolveConfig {
    #[serde(default = "defaults::Resolve::max_hash_density")]
    pub max_hash_density: f64,

    #[serde(default = "defaults::Resolve::batch_size")]
    pub batch_size: usize,

    #[serde(default = "defaults::Resolve::prefetch")]
    pub prefetch: usize,

    #[serde(default = "defaults::Resolve::threads")]
    pub threads: usize,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            max_hash_density: defaults::Resolve::max_hash_density(),
            batch_size: defaults::Resolve::batch_size(),
            prefetch: defaults::Resolve::prefetch(),
            threads: defaults::Resolve::threads(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WeightConfig {
    #[serde(default = "defaults::Weights::threads")]
    pub threads: usize,

    #[serde(default = "defaults::Weights::max_eigen_passes")]
    pub max_eigen_passes: u32,

    #[serde(default = "defaults::Weights::check_passes")]
    pub check_passes: u32,

    #[serde(default = "defaults::Weights::check_threshold")]
    pub check_threshold: f64,

    #[serde(default = "defaults::Weights::min_change")]
    pub min_change: f64,

    #[serde(default = "defaults::Weights::prob_random")]
    pub prob_random: u32,

    #[serde(default = "defaults::Weights::prob_weight")]
    pub prob_weight: u32,

    #[serde(default = "defaults::Weights::prob_follow")]
    pub prob_follow: u32,

    #[serde(default = "defaults::Weights::link_weight")]
    pub link_weight: [u32; 2],

    #[serde(default = "defaults::Weights::overrelax")]
    pub overrelax: f64,

    #[serde(default = "defaults::Weights::max_weight")]
    pub max_weight: u32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            threads: defaults::Weights::threads(),
            max_eigen_passes: defaults::Weights::max_eigen_passes(),
            check_passes: defaults::Weights::check_passes(),
            check_threshold: defaults::Weights::check_threshold(),
            min_change: defaults::Weights::min_change(),
            prob_random: defaults::Weights::prob_random(),
            prob_weight: defaults::Weights::prob_weight(),
            prob_follow: defaults::Weights::prob_follow(),
            link_weight: defaults::Weights::link_weight(),
            overrelax: defaults::Weights::overrelax(),
            max_weight: defaults::Weights::max_weight(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MatcherConfig {
    /// Length of the min-hash signature vector.
    #[serde(default = "defaults::Matcher::signatures")]
    pub signatures: usize,

    /// Positions that must agree for two signatures to count as near-duplicates.
    #[serde(default = "defaults::Matcher::threshold")]
    pub threshold: usize,

    #[serde(default = "defaults::Matcher::passes")]
    pub passes: usize,

    #[serde(default = "defaults::Matcher::block")]
    pub block: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            signatures: defaults::Matcher::signatures(),
            threshold: defaults::Matcher::threshold(),
            passes: defaults::Matcher::passes(),
            block: defaults::Matcher::block(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ImageMatcherConfig {
    #[serde(default = "defaults::ImageMatcher::threads")]
    pub threads: usize,

    #[serde(default = "defaults::ImageMatcher::buf_size")]
    pub buf_size: usize,

    #[serde(default = "defaults::ImageMatcher::vector_threshold")]
    pub vector_threshold: u32,
}

impl Default for ImageMatcherConfig {
    fn default() -> Self {
        Self {
            threads: defaults::ImageMatcher::threads(),
            buf_size: defaults::ImageMatcher::buf_size(),
            vector_threshold: defaults::ImageMatcher::vector_threshold(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MergeConfig {
    /// Classes at least this large get the giant-document penalty flag.
    #[serde(default = "defaults::Merge::giant_documents")]
    pub giant_documents: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            giant_documents: defaults::Merge::giant_documents(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UnreachableConfig {
    #[serde(default = "defaults::Unreachable::big_buf_size")]
    pub big_buf_size: usize,

    #[serde(default = "defaults::Unreachable::max_passes")]
    pub max_passes: u32,

    #[serde(default = "defaults::Unreachable::refilter_threshold")]
    pub refilter_threshold: f64,
}

impl Default for UnreachableConfig {
    fn default() -> Self {
        Self {
            big_buf_size: defaults::Unreachable::big_buf_size(),
            max_passes: defaults::Unreachable::max_passes(),
            refilter_threshold: defaults::Unreachable::refilter_threshold(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LexConfig {
    #[serde(default = "defaults::Lex::context_slots")]
    pub context_slots: usize,

    #[serde(default = "defaults::Lex::slot_budget")]
    pub slot_budget: usize,

    #[serde(default = "defaults::Lex::max_gap")]
    pub max_gap: u32,

    /// Absolute cap; words past it abort the run.
    #[serde(default = "defaults::Lex::max_word_chars")]
    pub max_word_chars: usize,

    /// Per-category caps, indexed by category tag; words past their
    /// category's cap turn into garbage.
    #[serde(default = "defaults::Lex::category_word_chars")]
    pub category_word_chars: Vec<usize>,
}

impl LexConfig {
    pub fn category_cap(&self, cat: u8) -> usize {
        self.category_word_chars
            .get(cat as usize)
            .copied()
            .unwrap_or(self.max_word_chars)
    }
}

impl Default for LexConfig {
    fn default() -> Self {
        Self {
            context_slots: defaults::Lex::context_slots(),
            slot_budget: defaults::Lex::slot_budget(),
            max_gap: defaults::Lex::max_gap(),
            max_word_chars: defaults::Lex::max_word_chars(),
            category_word_chars: defaults::Lex::category_word_chars(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RefTextsConfig {
    #[serde(default = "defaults::RefTexts::max_texts_per_class")]
    pub max_texts_per_class: usize,
}

impl Default for RefTextsConfig {
    fn default() -> Self {
        Self {
            max_texts_per_class: defaults::RefTexts::max_texts_per_class(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SortConfig {
    #[serde(default = "defaults::Sort::chunk_size")]
    pub chunk_size: usize,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::Sort::chunk_size(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct StageConfig {
    /// A stage fails once it has dropped more offenders than this.
    #[serde(default = "defaults::Stage::max_inconsistencies")]
    pub max_inconsistencies: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            max_inconsistencies: defaults::Stage::max_inconsistencies(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sane_defaults() {
        let cfg = GatherConfig::default();
        assert!(cfg.soft_max_obj_count <= cfg.hard_max_obj_count);

        let cfg = WeightConfig::default();
        assert_eq!(cfg.prob_random + cfg.prob_weight + cfg.prob_follow, 100);

        let cfg = MatcherConfig::default();
        assert!(cfg.threshold <= cfg.signatures);
    }
}
