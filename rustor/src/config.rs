/// Knobs for one package's controller. Policy constants (peer counts,
/// intervals) are fixed; these are the host-facing settings.
#[derive(Debug, Clone)]
pub struct Config {

    /// Listen port. `None` probes the conventional 6881..6889 range.
    pub listen_port: Option<u16>,

    /// Download rate cap in bytes per second. `None` is unlimited; peers
    /// then drive themselves from their input loops.
    pub download_limit: Option<u64>,

    /// Upload rate cap in bytes per second.
    pub upload_limit: Option<u64>,

    /// Trust pieces of files that already exist on disk with the declared
    /// length, rather than re-hashing them on open.
    pub assume_valid: bool,

    /// Peers to ask of the tracker per announce. Escalated when the
    /// returned list is exhausted.
    pub numwant: u32,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: None,
            download_limit: None,
            upload_limit: None,
            assume_valid: true,
            numwant: 50,
        }
    }
}
