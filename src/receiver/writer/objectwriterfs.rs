use super::{ObjectMetadata, ObjectWriter, ObjectWriterBuilder, ObjectWriterBuilderResult};
use crate::common::udpendpoint::UDPEndpoint;
use crate::tools::error::{FluteError, Result};
use std::{cell::RefCell, io::Write, time::SystemTime};

///
/// Write objects received by the `receiver` to a filesystem
///
#[derive(Debug)]
pub struct ObjectWriterFSBuilder {
    dest: std::path::PathBuf,
    enable_md5_check: bool,
}

impl ObjectWriterFSBuilder {
    pub fn new(dest: &std::path::Path, enable_md5_check: bool) -> Result<ObjectWriterFSBuilder> {
        if !dest.is_dir() {
            return Err(FluteError::new(format!("{:?} is not a directory", dest)));
        }

        Ok(ObjectWriterFSBuilder {
            dest: dest.to_path_buf(),
            enable_md5_check,
        })
    }
}

impl ObjectWriterBuilder for ObjectWriterFSBuilder {
    fn new_object_writer(
        &self,
        _endpoint: &UDPEndpoint,
        _tsi: u64,
        _toi: u128,
        meta: &ObjectMetadata,
        _now: SystemTime,
    ) -> ObjectWriterBuilderResult {
        ObjectWriterBuilderResult::StoreObject(Box::new(ObjectWriterFS {
            dest: self.dest.clone(),
            inner: RefCell::new(ObjectWriterFSInner {
                destination: None,
                writer: None,
            }),
            meta: meta.clone(),
            enable_md5_check: self.enable_md5_check,
        }))
    }

    fn fdt_received(
        &self,
        _endpoint: &UDPEndpoint,
        _tsi: u64,
        _fdt_xml: &str,
        _expires: Option<SystemTime>,
        _now: SystemTime,
    ) {
    }
}

///
/// Write an object to a file system.
/// Uses the content-location to create the destination path of the object.
/// If the destination path does not exists, the folder hierarchy is created.
/// Existing files will be overwritten by this object.
///
#[derive(Debug)]
pub struct ObjectWriterFS {
    /// Folder destination were the object will be written
    dest: std::path::PathBuf,
    inner: RefCell<ObjectWriterFSInner>,
    meta: ObjectMetadata,
    enable_md5_check: bool,
}

#[derive(Debug)]
struct ObjectWriterFSInner {
    destination: Option<std::path::PathBuf>,
    writer: Option<std::io::BufWriter<std::fs::File>>,
}

impl ObjectWriter for ObjectWriterFS {
    fn open(&self, _now: SystemTime) -> Result<()> {
        let url = url::Url::parse(&self.meta.content_location);
        let content_location_path = match &url {
            Ok(url) => url.path(),
            Err(url::ParseError::RelativeUrlWithoutBase)
            | Err(url::ParseError::RelativeUrlWithCannotBeABaseBase) => {
                &self.meta.content_location
            }
            Err(e) => {
                return Err(FluteError::new(format!(
                    "fail to parse content location {:?}: {:?}",
                    self.meta.content_location, e
                )));
            }
        };
        let relative_path = content_location_path
            .strip_prefix('/')
            .unwrap_or(content_location_path);
        let destination = self.dest.join(relative_path);
        log::info!("Receiving object into {:?}", destination);

        if let Some(parent) = destination.parent() {
            if !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::File::create(&destination)?;
        let mut inner = self.inner.borrow_mut();
        inner.writer = Some(std::io::BufWriter::new(file));
        inner.destination = Some(destination);
        Ok(())
    }

    fn write(&self, data: &[u8], _now: SystemTime) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let destination = inner.destination.clone();
        match inner.writer.as_mut() {
            Some(writer) => writer.write_all(data).map_err(|e| {
                FluteError::new(format!(
                    "fail to write data to file {:?}: {:?}",
                    destination, e
                ))
            }),
            None => Ok(()),
        }
    }

    fn complete(&self, _now: SystemTime) {
        let mut inner = self.inner.borrow_mut();
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush().ok();
        }
        log::info!("Object written to {:?}", inner.destination);
        inner.writer = None;
        inner.destination = None;
    }

    fn error(&self, _now: SystemTime) {
        let mut inner = self.inner.borrow_mut();
        inner.writer = None;
        if let Some(destination) = inner.destination.take() {
            log::error!("Removing partial object {:?}", destination);
            std::fs::remove_file(destination).ok();
        }
    }

    fn enable_md5_check(&self) -> bool {
        self.enable_md5_check
    }
}
