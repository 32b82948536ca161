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

pub struct Gather;

impl Gather {
    pub fn max_workers() -> usize {
        16
    }

    pub fn max_run_time_secs() -> u64 {
        300
    }

    pub fn min_server_delay_secs() -> u64 {
        5
    }

    pub fn max_retries() -> u8 {
        3
    }

    pub fn rec_err_dly1_secs() -> u64 {
        60
    }

    pub fn rec_err_dly2_secs() -> u64 {
        3600
    }

    pub fn rec_err_limit() -> u32 {
        10
    }

    pub fn max_resolvers() -> u32 {
        16
    }

    pub fn max_bucket_file_size() -> u64 {
        3 << 30
    }

    pub fn max_host_count() -> usize {
        1_000_000
    }

    pub fn soft_max_obj_count() -> u32 {
        100_000
    }

    pub fn hard_max_obj_count() -> u32 {
        200_000
    }

    pub fn doc_change_mix() -> u32 {
        192
    }

    pub fn auto_sync() -> u32 {
        512
    }
}

pub struct Resolve;

impl Resolve {
    pub fn max_hash_density() -> f64 {
        0.35
    }

    pub fn batch_size() -> usize {
        4096
    }

    pub fn prefetch() -> usize {
        8
    }

    pub fn threads() -> usize {
        4
    }
}

pub struct Weights;

impl Weights {
    pub fn threads() -> usize {
        4
    }

    pub fn max_eigen_passes() -> u32 {
        100
    }

    pub fn check_passes() -> u32 {
        10
    }

    pub fn check_threshold() -> f64 {
        1.1
    }

    pub fn min_change() -> f64 {
        0.0
    }

    pub fn prob_random() -> u32 {
        15
    }

    pub fn prob_weight() -> u32 {
        0
    }

    pub fn prob_follow() -> u32 {
        85
    }

    pub fn link_weight() -> [u32; 2] {
        [1, 1]
    }

    pub fn overrelax() -> f64 {
        1.0
    }

    pub fn max_weight() -> u32 {
        255
    }
}

pub struct Matcher;

impl Matcher {
    pub fn signatures() -> usize {
        32
    }

    pub fn threshold() -> usize {
        28
    }

    pub fn passes() -> usize {
        4
    }

    pub fn block() -> usize {
        64
    }
}

pub struct ImageMatcher;

impl ImageMatcher {
    pub fn threads() -> usize {
        4
    }

    pub fn buf_size() -> usize {
        64 << 20
    }

    pub fn vector_threshold() -> u32 {
        24
    }
}

pub struct Merge;

impl Merge {
    pub fn giant_documents() -> usize {
        1024
    }
}

pub struct Unreachable;

impl Unreachable {
    pub fn big_buf_size() -> usize {
        256 << 20
    }

    pub fn max_passes() -> u32 {
        10
    }

    pub fn refilter_threshold() -> f64 {
        0.9
    }
}

pub struct Lex;

impl Lex {
    pub fn context_slots() -> usize {
        8
    }

    pub fn slot_budget() -> usize {
        65_536
    }

    pub fn max_gap() -> u32 {
        4
    }

    pub fn max_word_chars() -> usize {
        64
    }

    pub fn category_word_chars() -> Vec<usize> {
        vec![32; 4]
    }
}

pub struct RefTexts;

impl RefTexts {
    pub fn max_texts_per_class() -> usize {
        32
    }
}

pub struct Sort;

impl Sort {
    pub fn chunk_size() -> usize {
        1_000_000
    }
}

pub struct Stage;

impl Stage {
    pub fn max_inconsistencies() -> u64 {
        1_000
    }
}
