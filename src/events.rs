use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::B256;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);

    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
}

/// ERC-20 Transfer logs carry exactly three topics; ERC-721 shares the
/// signature but indexes the token id as a fourth.
pub const ERC20_TRANSFER_TOPICS: usize = 3;

pub fn is_erc20_transfer(topics: &[B256]) -> bool {
    topics.len() == ERC20_TRANSFER_TOPICS && topics[0] == Transfer::SIGNATURE_HASH
}

pub fn decode_transfer_event(topics: &[B256], data: &[u8]) -> anyhow::Result<Transfer> {
    let decoded = Transfer::decode_raw_log(topics.iter().copied(), data)?;
    Ok(decoded)
}
