// DANS : src/chain/abi.rs

//! ABI des contrats PiggyBanks (fabrique), PiggyBank (tirelire) et des
//! tokens ERC20 / ERC721 qu'une tirelire peut détenir.

use alloy::primitives::B256;

alloy::sol! {
    /// La fabrique : chaque création de tirelire émet `Created`.
    #[sol(rpc)]
    interface IPiggyBanks {
        event Created(address piggyBank);
    }

    /// Une tirelire. Tous ses événements déclenchent une resynchronisation.
    #[sol(rpc)]
    interface IPiggyBank {
        event Received(address sender, uint256 amount);
        event Transferred(address owner);
        event TokenAdded(address token);
        event Renamed(bytes32 name);
        event Freed();

        function owner() external view returns (address);
        function name() external view returns (bytes32);
        function tokensCount() external view returns (uint256);
        function tokens(uint256 index) external view returns (address);
        function collectiblesCount() external view returns (uint256);
        function collectibles(uint256 index) external view returns (address);
        function collectedCount(address collectible) external view returns (uint256);
        function collected(address collectible, uint256 index) external view returns (uint256);
    }

    /// Sous-ensemble commun ERC20 / ERC721 utilisé pour les métadonnées.
    #[sol(rpc)]
    interface IToken {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function balanceOf(address holder) external view returns (uint256);
    }
}

/// Décode un nom stocké en `bytes32` : UTF-8 aligné à gauche, complété par
/// des zéros à droite.
pub fn decode_bytes32_text(word: B256) -> String {
    let bytes = word.as_slice();
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Inverse de [`decode_bytes32_text`]. Le texte est tronqué à 32 octets.
pub fn encode_bytes32_text(text: &str) -> B256 {
    let bytes = text.as_bytes();
    let len = bytes.len().min(32);
    B256::right_padding_from(&bytes[..len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes32_name_trims_trailing_zeros() {
        let word = encode_bytes32_text("My piggy bank");
        assert_eq!(decode_bytes32_text(word), "My piggy bank");
        assert_eq!(decode_bytes32_text(B256::ZERO), "");
    }

    #[test]
    fn bytes32_name_keeps_multibyte_characters() {
        let word = encode_bytes32_text("Tirelire 🐷");
        assert_eq!(decode_bytes32_text(word), "Tirelire 🐷");
    }

    #[test]
    fn bytes32_name_is_truncated_to_word_size() {
        let long = "a".repeat(40);
        assert_eq!(decode_bytes32_text(encode_bytes32_text(&long)).len(), 32);
    }
}
