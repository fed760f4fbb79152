//! V4L2 capture device with memory-mapped streaming I/O

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{Mmap, MmapOptions};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument};
use v4l::capability::Flags as CapFlags;
use v4l::format::FieldOrder;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC, Fraction};

use super::device::{
    BufferLayout, CaptureDevice, DequeuedBuffer, FormatRequest, Readiness,
};
use super::frame::{FrameInterval, NegotiatedFormat};

/// Raw buffer-queue ABI from `linux/videodev2.h`
mod sys {
    pub const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
    pub const MEMORY_MMAP: u32 = 1;

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct RequestBuffers {
        pub count: u32,
        pub type_: u32,
        pub memory: u32,
        pub capabilities: u32,
        pub flags: u8,
        pub reserved: [u8; 3],
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct Timecode {
        pub type_: u32,
        pub flags: u32,
        pub frames: u8,
        pub seconds: u8,
        pub minutes: u8,
        pub hours: u8,
        pub userbits: [u8; 4],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union BufferMemory {
        pub offset: u32,
        pub userptr: libc::c_ulong,
        pub planes: *mut libc::c_void,
        pub fd: i32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Buffer {
        pub index: u32,
        pub type_: u32,
        pub bytesused: u32,
        pub flags: u32,
        pub field: u32,
        pub timestamp: libc::timeval,
        pub timecode: Timecode,
        pub sequence: u32,
        pub memory: u32,
        pub m: BufferMemory,
        pub length: u32,
        pub reserved2: u32,
        pub request_fd: i32,
    }

    impl Buffer {
        /// Zeroed MMAP capture buffer descriptor for `index`
        pub fn mmap(index: u32) -> Self {
            // SAFETY: every field is plain data for which all-zero is valid.
            let mut buf: Buffer = unsafe { std::mem::zeroed() };
            buf.type_ = BUF_TYPE_VIDEO_CAPTURE;
            buf.memory = MEMORY_MMAP;
            buf.index = index;
            buf
        }
    }

    nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, RequestBuffers);
    nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, Buffer);
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, Buffer);
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, Buffer);
    nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
    nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
}

/// Timeout in whole milliseconds for `poll(2)`, rounded up so that a
/// sub-millisecond wait still blocks instead of polling once.
fn poll_millis(timeout: Duration) -> u16 {
    u16::try_from(timeout.as_nanos().div_ceil(1_000_000)).unwrap_or(u16::MAX)
}

/// An open V4L2 capture node
pub struct V4l2Device {
    device: Device,
    path: PathBuf,
}

impl V4l2Device {
    /// Open the device and check it can stream video capture
    #[instrument]
    pub fn open(path: &Path) -> io::Result<Self> {
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} does not support video capture", caps.card),
            ));
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} does not support streaming I/O", caps.card),
            ));
        }

        Ok(Self {
            device,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.device.handle().fd()
    }

    fn negotiated(format: &Format) -> NegotiatedFormat {
        NegotiatedFormat {
            width: format.width,
            height: format.height,
            fourcc: format.fourcc.repr,
            field: format!("{:?}", format.field_order),
            bytes_per_line: format.stride,
            size_image: format.size,
        }
    }

    fn stream_ioctl(
        &self,
        ioctl: unsafe fn(libc::c_int, *const libc::c_int) -> nix::Result<libc::c_int>,
    ) -> io::Result<()> {
        let buf_type = sys::BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        // SAFETY: the fd is owned by `self.device` and `buf_type` outlives the call.
        unsafe { ioctl(self.fd(), &buf_type) }?;
        Ok(())
    }
}

impl CaptureDevice for V4l2Device {
    type Region = Mmap;

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat> {
        let mut fmt = self.device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = FourCC::new(&request.pixel_format.fourcc());
        fmt.field_order = FieldOrder::Progressive;

        // The driver adjusts anything it cannot do and reports back
        let accepted = self.device.set_format(&fmt)?;
        Ok(Self::negotiated(&accepted))
    }

    fn format(&self) -> io::Result<NegotiatedFormat> {
        Ok(Self::negotiated(&self.device.format()?))
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        let params = Parameters::new(Fraction::new(interval.numerator, interval.denominator));
        let accepted = self.device.set_params(&params)?;
        Ok(FrameInterval::new(
            accepted.interval.numerator,
            accepted.interval.denominator,
        ))
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        let params = self.device.params()?;
        Ok(FrameInterval::new(
            params.interval.numerator,
            params.interval.denominator,
        ))
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let mut req = sys::RequestBuffers {
            count,
            type_: sys::BUF_TYPE_VIDEO_CAPTURE,
            memory: sys::MEMORY_MMAP,
            ..Default::default()
        };
        // SAFETY: `req` is a valid v4l2_requestbuffers for the duration of the call.
        unsafe { sys::vidioc_reqbufs(self.fd(), &mut req) }?;
        debug!(requested = count, granted = req.count, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout> {
        let mut buf = sys::Buffer::mmap(index);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        unsafe { sys::vidioc_querybuf(self.fd(), &mut buf) }?;
        // SAFETY: the driver fills `m.offset` for MMAP buffers.
        let offset = unsafe { buf.m.offset };
        Ok(BufferLayout {
            index,
            length: buf.length as usize,
            offset,
        })
    }

    fn map_buffer(&mut self, layout: &BufferLayout) -> io::Result<Mmap> {
        // SAFETY: the mapping is shared with the driver, which only writes
        // into it while the buffer is queued. The pool never hands out a
        // view of a queued buffer.
        unsafe {
            MmapOptions::new()
                .offset(layout.offset as u64)
                .len(layout.length)
                .map(self.fd())
        }
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        let mut buf = sys::Buffer::mmap(index);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        unsafe { sys::vidioc_qbuf(self.fd(), &mut buf) }?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        let mut buf = sys::Buffer::mmap(0);
        // SAFETY: `buf` is a valid v4l2_buffer for the duration of the call.
        unsafe { sys::vidioc_dqbuf(self.fd(), &mut buf) }?;
        let timestamp = Duration::from_secs(buf.timestamp.tv_sec.max(0) as u64)
            + Duration::from_micros(buf.timestamp.tv_usec.max(0) as u64);
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp,
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.stream_ioctl(sys::vidioc_streamon)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.stream_ioctl(sys::vidioc_streamoff)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        // SAFETY: the fd stays open for as long as `self.device` lives.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(poll_millis(timeout))) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("device reported {revents:?}"),
                    ));
                }
                Ok(Readiness::Ready)
            }
            Err(Errno::EINTR) => Ok(Readiness::Interrupted),
            Err(errno) => Err(errno.into()),
        }
    }
}
