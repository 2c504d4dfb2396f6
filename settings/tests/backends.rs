//! Conformance checks shared by the random-access backends:
//! last-writer-wins uniqueness, tombstoning, and resurrection. The
//! retention backend only supports whole-set saves and has its own suite.

mod common;

use common::*;
use settings::eeprom::EepromStore;
use settings::fcb::FcbStore;
use settings::zms::ZmsStore;
use settings::Store;

fn backends() -> Vec<(&'static str, Box<dyn Store>)> {
	vec![
		("fcb", Box::new(FcbStore::new(SimFlash::new(4, 256, 4)).unwrap())),
		("eeprom", Box::new(EepromStore::new(SimEeprom::new(1024)).unwrap())),
		("zms", Box::new(ZmsStore::new(SimIdStore::default()).unwrap())),
	]
}

#[test]
fn at_most_one_live_value_per_name() {
	for (which, mut store) in backends() {
		store.save("net/ip", b"192.168.1.1").unwrap();
		store.save("net/ip", b"10.0.0.1").unwrap();
		store.save("net/mask", b"24").unwrap();

		let mut loaded = load_all(&mut *store);
		loaded.sort();

		assert_eq!(
			loaded,
			vec![
				("net/ip".to_string(), b"10.0.0.1".to_vec()),
				("net/mask".to_string(), b"24".to_vec()),
			],
			"backend {which}"
		);
	}
}

#[test]
fn delete_tombstones_and_save_resurrects() {
	for (which, mut store) in backends() {
		store.save("key", b"one").unwrap();
		store.save("key", &[]).unwrap();

		assert!(load_all(&mut *store).is_empty(), "backend {which}: tombstoned key surfaced");

		store.save("key", b"two").unwrap();
		assert_eq!(load_all(&mut *store), vec![("key".to_string(), b"two".to_vec())], "backend {which}");
	}
}

#[test]
fn deleting_an_absent_name_is_harmless() {
	for (which, mut store) in backends() {
		store.save("ghost", &[]).unwrap();
		assert!(load_all(&mut *store).is_empty(), "backend {which}");
	}
}

#[test]
fn settings_round_trip_scenario() {
	// save("net/ip", ...); save("net/mask", ...); delete("net/ip"):
	// a load then delivers only net/mask.
	for (which, mut store) in backends() {
		store.save("net/ip", b"192.168.1.10").unwrap();
		store.save("net/mask", b"255.255.255.0").unwrap();
		store.save("net/ip", &[]).unwrap();

		let loaded = load_all(&mut *store);

		assert_eq!(loaded, vec![("net/mask".to_string(), b"255.255.255.0".to_vec())], "backend {which}");
	}
}

#[test]
fn values_stream_through_the_reader_in_pieces() {
	for (which, mut store) in backends() {
		store.save("blob", b"abcdefghij").unwrap();

		let mut seen = Vec::new();

		store
			.load(&mut |name, reader| {
				assert_eq!(name, "blob", "backend {which}");
				assert_eq!(reader.len(), 10);

				// Read in 3-byte chunks to exercise partial reads.
				let mut buf = [0u8; 3];
				loop {
					let n = reader.read(&mut buf).unwrap();
					if n == 0 {
						break;
					}
					seen.extend_from_slice(&buf[..n]);
				}

				Ok(())
			})
			.unwrap();

		assert_eq!(seen, b"abcdefghij", "backend {which}");
	}
}
