// Central place for shared string constants.
// Keep these out of the graph/patch code to reduce duplication and make tweaks safer.

// Value reported by a computed item whose function failed or whose inputs are missing.
pub const ERROR_VALUE: &str = "error";

// Value reported by placeholders and by document paths that match nothing.
pub const EMPTY_VALUE: &str = "";

pub const DEFAULT_PATCH_FILE_NAME: &str = "user_patches.json";

// Identity keys are "name,virtual_path,xpath,attribute".
pub const IDENTITY_KEY_SEPARATOR: char = ',';

// Hidden placeholder rows inserted ahead of each reference's items in display rows.
pub const SEPARATOR_ITEM_PREFIX: &str = "__separator__";

// Leading bytes of a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

// Group expansion naming: "<prefix><index>_<name>" and "<display prefix> <index>: <display name>".
pub const GROUP_NAME_JOINER: &str = "_";
pub const GROUP_DISPLAY_JOINER: &str = ": ";

// Document versions as shown in logs and column headers.
pub const EN_VERSION_ORIGINAL: &str = "original";
pub const EN_VERSION_MERGED: &str = "merged";
pub const EN_VERSION_COMPUTED: &str = "computed";
pub const EN_VERSION_EDITED: &str = "edited";
