pub mod add;
pub mod del;

/// Per-invocation arguments shared by attach and detach.
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    /// Verbatim config bytes, forwarded to the address manager.
    pub raw_config: Vec<u8>,
}
