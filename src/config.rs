use serde::{Deserialize, Serialize};

fn default_tiles() -> usize {
    2
}
fn default_mem_size() -> usize {
    1 << 20
}
fn default_num_eps() -> usize {
    16
}
fn default_max_noc_packet_size() -> usize {
    1024
}
fn default_block_size() -> usize {
    64
}
fn default_buf_count() -> usize {
    4
}
fn default_buf_size() -> usize {
    1024
}
fn default_req_count() -> usize {
    4
}
fn default_lat_1() -> u64 {
    1
}
fn default_lat_3() -> u64 {
    3
}
fn default_mem_region_size() -> u64 {
    1 << 20
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Number of tiles on the NoC.
    #[serde(default = "default_tiles")]
    pub tiles: usize,

    /// Bytes of local memory per tile.
    #[serde(default = "default_mem_size")]
    pub mem_size: usize,

    /// TCU parameters, shared by all tiles.
    #[serde(default)]
    pub tcu: TcuParams,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            tiles: default_tiles(),
            mem_size: default_mem_size(),
            tcu: TcuParams::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TcuParams {
    /// Number of endpoints per TCU.
    #[serde(default = "default_num_eps")]
    pub num_eps: usize,

    /// Maximum size of one NoC packet (header plus payload for messages).
    /// Must not exceed `buf_size`.
    #[serde(default = "default_max_noc_packet_size")]
    pub max_noc_packet_size: usize,

    /// Local memory interface width; transfers issue block-aligned requests.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of transfer buffers. At least 2 when translation is enabled.
    #[serde(default = "default_buf_count")]
    pub buf_count: usize,

    /// Size of one transfer buffer in bytes.
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,

    /// Outstanding memory requests per transfer.
    #[serde(default = "default_req_count")]
    pub req_count: usize,

    /// TLB entries; 0 disables translation.
    #[serde(default)]
    pub tlb_entries: usize,

    #[serde(default = "default_lat_3")]
    pub register_access_latency: u64,

    #[serde(default = "default_lat_3")]
    pub cmd_to_noc_latency: u64,

    #[serde(default = "default_lat_1")]
    pub start_msg_transfer_delay: u64,

    #[serde(default = "default_lat_1")]
    pub transfer_to_mem_latency: u64,

    #[serde(default = "default_lat_3")]
    pub noc_to_transfer_latency: u64,

    #[serde(default = "default_lat_1")]
    pub spm_read_latency: u64,

    #[serde(default = "default_lat_1")]
    pub spm_write_latency: u64,

    /// Memory tile the LLC slave port forwards to.
    #[serde(default)]
    pub mem_tile: u16,

    /// Offset within the memory tile where this tile's region starts.
    #[serde(default)]
    pub mem_offset: u64,

    /// Size of this tile's region in the memory tile.
    #[serde(default = "default_mem_region_size")]
    pub mem_region_size: u64,
}

impl Default for TcuParams {
    fn default() -> TcuParams {
        TcuParams {
            num_eps: default_num_eps(),
            max_noc_packet_size: default_max_noc_packet_size(),
            block_size: default_block_size(),
            buf_count: default_buf_count(),
            buf_size: default_buf_size(),
            req_count: default_req_count(),
            tlb_entries: 0,
            register_access_latency: default_lat_3(),
            cmd_to_noc_latency: default_lat_3(),
            start_msg_transfer_delay: default_lat_1(),
            transfer_to_mem_latency: default_lat_1(),
            noc_to_transfer_latency: default_lat_3(),
            spm_read_latency: default_lat_1(),
            spm_write_latency: default_lat_1(),
            mem_tile: 0,
            mem_offset: 0,
            mem_region_size: default_mem_region_size(),
        }
    }
}
