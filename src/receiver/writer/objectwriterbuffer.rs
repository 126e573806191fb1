use super::{ObjectMetadata, ObjectWriter, ObjectWriterBuilder, ObjectWriterBuilderResult};
use crate::common::udpendpoint::UDPEndpoint;
use crate::tools::error::Result;
use std::{cell::RefCell, rc::Rc, time::SystemTime};

///
/// Write objects received by the `receiver` to buffers
///
#[derive(Debug, Default)]
pub struct ObjectWriterBufferBuilder {
    /// List of all objects received
    pub objects: RefCell<Vec<Rc<RefCell<ObjectWriterBuffer>>>>,
    /// Raw XML of every completed FDT instance, in arrival order
    pub fdt_instances: RefCell<Vec<String>>,
    /// True when MD5 check is enabled
    pub enable_md5_check: bool,
}

/// Object stored in a buffer
#[derive(Debug)]
pub struct ObjectWriterBuffer {
    /// true when the object is fully received
    pub complete: bool,
    /// true when an error occured during the reception
    pub error: bool,
    /// buffer containing the data of the object
    pub data: Vec<u8>,
    /// Metadata of the object
    pub meta: ObjectMetadata,
    /// Time when the object reception started
    pub start_time: SystemTime,
    /// Time when the object reception ended
    pub end_time: Option<SystemTime>,
}

#[derive(Debug)]
struct ObjectWriterBufferWrapper {
    inner: Rc<RefCell<ObjectWriterBuffer>>,
    enable_md5_check: bool,
}

impl ObjectWriterBufferBuilder {
    pub fn new(enable_md5_check: bool) -> ObjectWriterBufferBuilder {
        ObjectWriterBufferBuilder {
            objects: RefCell::new(Vec::new()),
            fdt_instances: RefCell::new(Vec::new()),
            enable_md5_check,
        }
    }
}

impl ObjectWriterBuilder for ObjectWriterBufferBuilder {
    fn new_object_writer(
        &self,
        _endpoint: &UDPEndpoint,
        _tsi: u64,
        _toi: u128,
        meta: &ObjectMetadata,
        now: SystemTime,
    ) -> ObjectWriterBuilderResult {
        let obj = Rc::new(RefCell::new(ObjectWriterBuffer {
            complete: false,
            error: false,
            data: Vec::new(),
            meta: meta.clone(),
            start_time: now,
            end_time: None,
        }));

        let wrapper = Box::new(ObjectWriterBufferWrapper {
            inner: obj.clone(),
            enable_md5_check: self.enable_md5_check,
        });
        self.objects.borrow_mut().push(obj);
        ObjectWriterBuilderResult::StoreObject(wrapper)
    }

    fn fdt_received(
        &self,
        _endpoint: &UDPEndpoint,
        _tsi: u64,
        fdt_xml: &str,
        _expires: Option<SystemTime>,
        _now: SystemTime,
    ) {
        self.fdt_instances.borrow_mut().push(fdt_xml.to_owned());
    }
}

impl ObjectWriter for ObjectWriterBufferWrapper {
    fn open(&self, _now: SystemTime) -> Result<()> {
        Ok(())
    }

    fn write(&self, data: &[u8], _now: SystemTime) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.data.extend(data);
        Ok(())
    }

    fn complete(&self, now: SystemTime) {
        let mut inner = self.inner.borrow_mut();
        log::info!("Object {} complete", inner.meta.content_location);
        inner.complete = true;
        inner.end_time = Some(now);
    }

    fn error(&self, now: SystemTime) {
        let mut inner = self.inner.borrow_mut();
        log::error!("Object {} received with error", inner.meta.content_location);
        inner.error = true;
        inner.end_time = Some(now);
    }

    fn enable_md5_check(&self) -> bool {
        self.enable_md5_check
    }
}
