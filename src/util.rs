use bevy::{
    prelude::*,
    render::{
        render_resource::{encase::internal::WriteInto, *},
        renderer::{RenderDevice, RenderQueue},
    },
};
use std::ops::Deref;

fn write_uniform<T: ShaderType + WriteInto>(value: &T, buffer: &mut [u8]) -> bool {
    match encase::UniformBuffer::new(buffer).write(value) {
        Ok(()) => true,
        Err(error) => {
            error!("Failed to encode a uniform value: {error}");
            false
        }
    }
}

/// A uniform buffer holding a single [`ShaderType`] value, rewritten through the queue whenever
/// the value changes.
pub struct GpuBuffer<T> {
    buffer: Buffer,
    value: Option<T>,
}

impl<T: ShaderType + WriteInto> GpuBuffer<T> {
    pub fn create_labeled<'a>(
        label: impl Into<Option<&'a str>>,
        device: &RenderDevice,
        value: &T,
    ) -> Self {
        let mut contents = vec![0; value.size().get() as usize];
        write_uniform(value, &mut contents);

        let buffer = device.create_buffer_with_data(&BufferInitDescriptor {
            label: label.into(),
            usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
            contents: &contents,
        });

        Self {
            buffer,
            value: None,
        }
    }

    pub fn set_value(&mut self, value: T) {
        self.value = Some(value);
    }

    /// Writes the pending value, if any, into the buffer. The value is consumed.
    pub fn update(&mut self, queue: &RenderQueue) {
        let Some(value) = self.value.take() else {
            return;
        };

        let mut contents = vec![0; value.size().get() as usize];
        if write_uniform(&value, &mut contents) {
            queue.write_buffer(&self.buffer, 0, &contents);
        }
    }
}

impl<T> Deref for GpuBuffer<T> {
    type Target = Buffer;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<'a, T> IntoBinding<'a> for &'a GpuBuffer<T> {
    #[inline]
    fn into_binding(self) -> BindingResource<'a> {
        self.buffer.as_entire_binding()
    }
}
