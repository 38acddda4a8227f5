use std::{
	fmt::Write as _,
	fs,
	io::ErrorKind,
	path::{Path, PathBuf},
	sync::Mutex,
};

use crate::error::{FileAction, StoreError, StoreFileError};

use super::KeyValueStore;

/// One JSON file per key under a directory.
///
/// Writes go to a sibling temp file that is then renamed over the target, so a crash mid-write
/// leaves the previous value intact.
#[derive(Debug)]
pub struct FileStore {
	dir: PathBuf,
	write_lock: Mutex<()>,
}

impl FileStore {
	pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
		let dir = dir.as_ref();

		fs::create_dir_all(dir).map_err(|e| StoreFileError::for_directory(dir, e))?;

		Ok(Self {
			dir: dir.to_path_buf(),
			write_lock: Mutex::new(()),
		})
	}

	fn path_for(&self, key: &str) -> PathBuf {
		let mut file_name = String::with_capacity(key.len() + 5);
		for c in key.chars() {
			if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
				file_name.push(c);
			} else {
				// Can't fail when writing into a String
				let _ = write!(file_name, "%{:02X}", u32::from(c));
			}
		}
		file_name.push_str(".json");

		self.dir.join(file_name)
	}
}

impl KeyValueStore for FileStore {
	fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		let path = self.path_for(key);

		match fs::read_to_string(&path) {
			Ok(contents) => Ok(Some(contents)),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(StoreFileError::for_key(FileAction::Read, key, path, e).into()),
		}
	}

	fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
		let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

		let path = self.path_for(key);
		let tmp_path = path.with_extension("json.tmp");

		fs::write(&tmp_path, value).map_err(|e| {
			StoreFileError::for_key(FileAction::WriteTemp, key, &tmp_path, e)
		})?;
		fs::rename(&tmp_path, &path)
			.map_err(|e| StoreFileError::for_key(FileAction::Replace, key, &path, e))?;

		Ok(())
	}

	fn remove(&self, key: &str) -> Result<(), StoreError> {
		let path = self.path_for(key);

		match fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
			Err(e) => Err(StoreFileError::for_key(FileAction::Remove, key, path, e).into()),
		}
	}
}
