use bip39::Mnemonic;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Network;
use proptest::prelude::*;

use sovereign_signer::tx::fee_for;
use sovereign_signer::{
    aggregate_public_keys, path_for, seed_from_recovery_phrase, statechain_path, Layer,
    TransferIndex, TxBuilder,
};

const OWNER_ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
const DEST_ADDR: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";
const FUNDING_TXID: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

fn any_phrase() -> impl Strategy<Value = String> {
    prop::array::uniform16(any::<u8>()).prop_map(|entropy| {
        Mnemonic::from_entropy(&entropy)
            .expect("16-byte entropy is a valid mnemonic")
            .to_string()
    })
}

fn any_secret_key() -> impl Strategy<Value = SecretKey> {
    prop::array::uniform32(any::<u8>()).prop_filter_map("valid secp256k1 scalar", |bytes| {
        SecretKey::from_slice(&bytes).ok()
    })
}

proptest! {
    #[test]
    fn seeds_are_deterministic_and_passphrase_sensitive(
        phrase in any_phrase(),
        passphrase in "[a-zA-Z0-9]{1,16}",
    ) {
        let first = seed_from_recovery_phrase(&phrase, &passphrase).expect("valid phrase");
        let second = seed_from_recovery_phrase(&phrase, &passphrase).expect("valid phrase");
        prop_assert_eq!(first.expose(), second.expose());

        let unprotected = seed_from_recovery_phrase(&phrase, "").expect("valid phrase");
        prop_assert_ne!(first.expose(), unprotected.expose());
    }

    #[test]
    fn layer_paths_never_collide(account in 0u32..0x8000_0000) {
        let paths: Vec<String> = Layer::ALL
            .iter()
            .map(|layer| path_for(*layer, account).expect("account in range").to_string())
            .collect();

        for i in 0..paths.len() {
            for j in (i + 1)..paths.len() {
                prop_assert_ne!(&paths[i], &paths[j]);
            }
        }
    }

    #[test]
    fn statechain_rotation_changes_the_path(
        account in 0u32..1000,
        start in 0i64..1000,
        offset in 1i64..1000,
    ) {
        let before = statechain_path(account, TransferIndex::new(start).unwrap()).unwrap();
        let after = statechain_path(account, TransferIndex::new(start + offset).unwrap()).unwrap();
        prop_assert_ne!(before.to_string(), after.to_string());
    }

    #[test]
    fn fee_estimation_is_linear_in_the_rate(
        inputs in 1usize..400,
        outputs in 1usize..400,
        rate in 1u64..5_000,
    ) {
        let unit = fee_for(inputs, outputs, 1);
        prop_assert_eq!(fee_for(inputs, outputs, rate), unit * rate);
        prop_assert!(fee_for(inputs + 1, outputs, rate) > fee_for(inputs, outputs, rate));
        prop_assert!(fee_for(inputs, outputs + 1, rate) > fee_for(inputs, outputs, rate));
    }

    #[test]
    fn change_application_conserves_value(
        input_sats in 200_000u64..100_000_000,
        spend_sats in 1_000u64..20_000,
        fee_rate in 1u64..500,
    ) {
        let mut builder = TxBuilder::new(Network::Bitcoin);
        builder
            .add_input(FUNDING_TXID, 0, input_sats, bitcoin::ScriptBuf::new())
            .expect("input accepted");
        builder.add_output(DEST_ADDR, spend_sats).expect("output accepted");

        let fee = builder.apply_change(OWNER_ADDR, fee_rate).expect("inputs cover the spend");

        prop_assert_eq!(
            builder.total_input_sats(),
            builder.total_output_sats() + fee,
            "every input sat is either an output or fee",
        );
        prop_assert!(fee >= fee_for(1, builder.outputs().len(), fee_rate));
    }

    #[test]
    fn key_aggregation_ignores_supply_order(
        secrets in prop::collection::vec(any_secret_key(), 2..6),
    ) {
        let secp = Secp256k1::new();
        let publics: Vec<PublicKey> = secrets.iter().map(|k| k.public_key(&secp)).collect();
        let distinct: std::collections::HashSet<_> = publics.iter().collect();
        prop_assume!(distinct.len() == publics.len());

        let mut reversed = publics.clone();
        reversed.reverse();

        let forward = aggregate_public_keys(&publics).expect("distinct keys aggregate");
        let backward = aggregate_public_keys(&reversed).expect("distinct keys aggregate");
        prop_assert_eq!(forward.x_only(), backward.x_only());
        prop_assert_eq!(forward.participants(), backward.participants());
    }
}
