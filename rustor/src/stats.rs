use std::net::SocketAddr;
use crate::ID;

/// Snapshot of one package's swarm, as reported by its controller.
#[derive(Debug, Clone)]
pub struct SwarmStats {

    pub num_peers: usize,

    pub num_pieces: u32,

    pub num_complete_pieces: u32,

    pub bytes_left: u64,

    pub total_downloaded: u64,

    pub total_uploaded: u64,

    // Aggregate over all connected peers, bytes per second.
    pub download_rate: f64,

    pub upload_rate: f64,

    pub endgame: bool,

    pub peers: Vec<PeerStats>,

}

impl SwarmStats {
    pub fn is_seed(&self) -> bool {
        self.num_complete_pieces == self.num_pieces
    }
}

#[derive(Debug, Clone)]
pub struct PeerStats {

    pub addr: SocketAddr,

    pub peer_id: Option<ID>,

    pub am_choking: bool,

    pub am_interested: bool,

    pub peer_choking: bool,

    pub peer_interested: bool,

    pub download_rate: f64,

    pub upload_rate: f64,

}
